//! # switchboard-core
//!
//! Presence, connection directory, relay and message routing for a
//! horizontally-partitioned chat service.
//!
//! Each server instance holds live streams for a subset of users. A message
//! for a user connected here is pushed straight into that user's sink; a
//! message for a user connected elsewhere is published onto the owning
//! server's inbound relay topic, found through the shared directory.
//!
//! - **Directory** - fleet-wide user -> owning server record
//! - **Relay** - durable topic pub/sub used only between servers
//! - **Presence** - this server's user -> sink map
//! - **Router** - picks local delivery or relay for every message
//! - **Session** - one user's connection lifetime, the only writer of
//!   presence and directory entries
//!
//! ## Architecture
//!
//! ```text
//!  client ──▶ Session ──registers──▶ Presence + Directory
//!                ▲
//!                │ drains sink
//!  Send ──▶   Router ──hit──▶ Presence sink
//!                │
//!                └──miss──▶ Directory lookup ──▶ Relay publish ──▶ peer Router
//! ```

pub mod directory;
pub mod message;
pub mod presence;
pub mod relay;
pub mod router;
pub mod session;

pub use directory::{ConnectionRecord, Directory, DirectoryError, MemoryDirectory, ServerRecord};
pub use message::{ChatMessage, ServerId, UserId, UNADDRESSED};
pub use presence::{PresenceError, PresenceRegistry, PushError, Sink, SinkReceiver};
pub use relay::{
    subject_matches, MemoryBroker, RelayError, RelayHandler, RelayTransport, Subscription,
    TopicScheme,
};
pub use router::{DropReason, RouteOutcome, Router, RouterConfig};
pub use session::{
    Outbound, OutboundError, Session, SessionConfig, SessionEnd, SessionError, SessionManager,
    SessionState,
};
