//! Relay envelope: the form of a chat message on a relay topic.
//!
//! The destination server is implied by the topic the envelope is published
//! to, so the envelope carries no routing or sequencing metadata. The broker
//! owns delivery guarantees.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Maximum encoded envelope size (256 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 256 * 1024;

/// A chat message in transit between servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub from: u32,
    pub to: u32,
    pub text: String,
}

/// Encode an envelope as a MessagePack map.
///
/// # Errors
///
/// Returns an error if encoding fails or the result exceeds [`MAX_ENVELOPE_SIZE`].
pub fn encode(envelope: &RelayEnvelope) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(envelope)?;
    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    Ok(Bytes::from(payload))
}

/// Decode an envelope.
///
/// # Errors
///
/// Returns an error if the payload is oversized or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<RelayEnvelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(rmp_serde::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = RelayEnvelope {
            from: 7,
            to: 9,
            text: "hi".to_string(),
        };
        let bytes = encode(&envelope).unwrap();
        assert_eq!(decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode(b"\xc1not msgpack"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_frame_bytes_are_not_an_envelope() {
        // A length-prefixed client frame must not be mistaken for an envelope.
        let frame = crate::codec::encode(&crate::Frame::send(7, 9, "hi")).unwrap();
        assert!(decode(&frame).is_err());
    }
}
