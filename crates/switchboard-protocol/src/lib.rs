//! # switchboard-protocol
//!
//! Wire formats for the switchboard chat relay.
//!
//! Two formats live here:
//!
//! - **Frames** - the messages exchanged with an end-user client over its
//!   bidirectional stream, length-prefixed MessagePack.
//! - **Envelopes** - the payload a server publishes onto another server's
//!   inbound relay topic. The topic itself carries the routing, so the
//!   envelope is just the chat message.
//!
//! ## Example
//!
//! ```rust
//! use switchboard_protocol::{codec, Frame};
//!
//! let frame = Frame::send(7, 9, "hi");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::RelayEnvelope;
pub use frames::{codes, Frame, FrameType};
pub use version::{Version, PROTOCOL_VERSION};
