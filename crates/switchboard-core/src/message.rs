//! Chat message type.

use switchboard_protocol::RelayEnvelope;

/// End-user identifier.
pub type UserId = u32;

/// Server instance identifier.
pub type ServerId = u32;

/// Recipient id meaning "no recipient"; such messages are dropped as a no-op.
pub const UNADDRESSED: UserId = 0;

/// A chat message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    from: UserId,
    to: UserId,
    text: String,
}

impl ChatMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(from: UserId, to: UserId, text: impl Into<String>) -> Self {
        Self {
            from,
            to,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn from(&self) -> UserId {
        self.from
    }

    #[must_use]
    pub fn to(&self) -> UserId {
        self.to
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the message has no recipient.
    #[must_use]
    pub fn is_unaddressed(&self) -> bool {
        self.to == UNADDRESSED
    }

    /// Wire form for relaying to another server.
    #[must_use]
    pub fn to_envelope(&self) -> RelayEnvelope {
        RelayEnvelope {
            from: self.from,
            to: self.to,
            text: self.text.clone(),
        }
    }

    /// Rebuild a message received from another server.
    #[must_use]
    pub fn from_envelope(envelope: RelayEnvelope) -> Self {
        Self {
            from: envelope.from,
            to: envelope.to,
            text: envelope.text,
        }
    }
}

impl From<RelayEnvelope> for ChatMessage {
    fn from(envelope: RelayEnvelope) -> Self {
        Self::from_envelope(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = ChatMessage::new(7, 9, "hi");
        assert_eq!(msg.from(), 7);
        assert_eq!(msg.to(), 9);
        assert_eq!(msg.text(), "hi");
        assert!(!msg.is_unaddressed());
    }

    #[test]
    fn test_unaddressed() {
        assert!(ChatMessage::new(7, UNADDRESSED, "hi").is_unaddressed());
    }

    #[test]
    fn test_envelope_conversion_keeps_content() {
        let msg = ChatMessage::new(7, 9, "hi");
        let back = ChatMessage::from_envelope(msg.to_envelope());
        assert_eq!(back, msg);

        let via_into: ChatMessage = msg.to_envelope().into();
        assert_eq!(via_into, msg);
    }
}
