//! # switchboard-transport
//!
//! Adapters between switchboard and the systems it runs against:
//!
//! - **WebSocket** - client side of the chat stream (`websocket` feature)
//! - **JetStream** - NATS JetStream as the relay broker (`jetstream` feature)
//! - **SQL** - Postgres (or SQLite) as the connection directory (`sql` feature)
//!
//! The relay and directory adapters implement the `RelayTransport` and
//! `Directory` traits from `switchboard-core`, so the server can run against
//! them or against the in-memory implementations interchangeably.
//!
//! ```rust,ignore
//! use switchboard_transport::ChatClient;
//!
//! let mut client = ChatClient::connect("ws://127.0.0.1:8080/ws", 7).await?;
//! client.send(9, "hi").await?;
//! while let Some(message) = client.recv().await? {
//!     println!("{} says {}", message.from(), message.text());
//! }
//! ```

pub mod error;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "jetstream")]
pub mod jetstream;

#[cfg(feature = "sql")]
pub mod sql;

pub use error::TransportError;

#[cfg(feature = "websocket")]
pub use websocket::{ChatClient, ChatReceiver, ChatSender};

#[cfg(feature = "jetstream")]
pub use jetstream::JetStreamRelay;

#[cfg(feature = "sql")]
pub use sql::{SqlDirectory, SqlDirectoryConfig};
