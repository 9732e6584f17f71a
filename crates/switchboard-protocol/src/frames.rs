//! Frame types for the client stream.
//!
//! A client opens its stream with `Connect`, the server answers `Connected`,
//! and from then on the client sends `Send` requests while the server pushes
//! `Deliver` frames. There is no acknowledgement for `Send`: delivery is
//! fire-and-forget and a message to an offline user is silently dropped.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Send = 0x03,
    Deliver = 0x04,
    Error = 0x05,
    Ping = 0x06,
    Pong = 0x07,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Send),
            0x04 => Ok(FrameType::Deliver),
            0x05 => Ok(FrameType::Error),
            0x06 => Ok(FrameType::Ping),
            0x07 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// First frame was not a valid `Connect`.
    pub const BAD_HANDSHAKE: u16 = 4000;
    /// Client protocol major version differs from the server's.
    pub const UNSUPPORTED_VERSION: u16 = 4001;
    /// The user already has a live session on this server.
    pub const ALREADY_CONNECTED: u16 = 4009;
    /// The server is shutting down and accepts no new sessions.
    pub const SHUTTING_DOWN: u16 = 5001;
    /// The connection directory could not be reached.
    pub const DIRECTORY_UNAVAILABLE: u16 = 5003;
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Opens a session for a user.
    #[serde(rename = "connect")]
    Connect {
        /// Client protocol major version.
        version: u8,
        /// The connecting user.
        user_id: u32,
    },

    /// Session accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Server instance now owning the user's connection.
        server_id: u32,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended ping interval in milliseconds.
        heartbeat: u32,
    },

    /// Chat message request from a client.
    #[serde(rename = "send")]
    Send {
        /// Sending user.
        from: u32,
        /// Recipient, `0` for unaddressed.
        to: u32,
        /// Message body.
        text: String,
    },

    /// Chat message pushed to the recipient.
    #[serde(rename = "deliver")]
    Deliver {
        /// Sending user.
        from: u32,
        /// Message body.
        text: String,
    },

    /// Error response; the server closes the stream after sending one.
    #[serde(rename = "error")]
    Error {
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Send { .. } => FrameType::Send,
            Frame::Deliver { .. } => FrameType::Deliver,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, user_id: u32) -> Self {
        Frame::Connect { version, user_id }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(server_id: u32, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            server_id,
            version,
            heartbeat,
        }
    }

    /// Create a new Send frame.
    #[must_use]
    pub fn send(from: u32, to: u32, text: impl Into<String>) -> Self {
        Frame::Send {
            from,
            to,
            text: text.into(),
        }
    }

    /// Create a new Deliver frame.
    #[must_use]
    pub fn deliver(from: u32, text: impl Into<String>) -> Self {
        Frame::Deliver {
            from,
            text: text.into(),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::connect(1, 7).frame_type(), FrameType::Connect);
        assert_eq!(Frame::send(7, 9, "hi").frame_type(), FrameType::Send);
        assert_eq!(Frame::deliver(7, "hi").frame_type(), FrameType::Deliver);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x03), Ok(FrameType::Send));
        assert_eq!(u8::from(FrameType::Pong), 0x07);
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0x08).is_err());
    }

    #[test]
    fn test_send_has_no_request_id() {
        // Sends are fire-and-forget; nothing in the frame asks for a receipt.
        let frame = Frame::send(7, 9, "hi");
        let Frame::Send { from, to, text } = frame else {
            panic!("expected send frame");
        };
        assert_eq!((from, to, text.as_str()), (7, 9, "hi"));
    }
}
