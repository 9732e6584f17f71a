//! Presence registry.
//!
//! Maps each user connected to this server to the sink feeding that user's
//! outbound stream. Entries are added and removed only by the user's session;
//! the router only looks them up.
//!
//! The map is the single point of synchronisation for presence on a server.
//! Lookups hand out a cloned [`Sink`], so pushing a message never happens
//! while a map guard is held.

use crate::message::{ChatMessage, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Default number of messages a sink buffers before pushes fail.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Presence errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    /// The user already has a sink on this server.
    #[error("User {0} is already present on this server")]
    AlreadyPresent(UserId),
}

/// Why a push into a sink failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The sink's buffer is at capacity.
    #[error("Sink full")]
    Full,
    /// The session draining the sink has gone away.
    #[error("Sink closed")]
    Closed,
}

/// Sending half of a user's delivery queue.
#[derive(Debug, Clone)]
pub struct Sink {
    user: UserId,
    tx: mpsc::Sender<ChatMessage>,
}

impl Sink {
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Enqueue a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] at capacity and [`PushError::Closed`] once
    /// the receiving session has stopped.
    pub fn push(&self, message: ChatMessage) -> Result<(), PushError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a user's delivery queue, owned by the session.
#[derive(Debug)]
pub struct SinkReceiver {
    user: UserId,
    rx: mpsc::Receiver<ChatMessage>,
}

impl SinkReceiver {
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Next queued message, in push order. `None` once closed and drained.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }

    /// Stop accepting pushes. Already-buffered messages can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Per-server map from connected user to sink.
#[derive(Debug)]
pub struct PresenceRegistry {
    sinks: DashMap<UserId, Sink>,
    capacity: usize,
}

impl PresenceRegistry {
    /// Create a registry whose sinks buffer `capacity` messages (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sinks: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create and register a sink for `user`.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::AlreadyPresent`] if the user already has one.
    pub fn add(&self, user: UserId) -> Result<SinkReceiver, PresenceError> {
        match self.sinks.entry(user) {
            Entry::Occupied(_) => Err(PresenceError::AlreadyPresent(user)),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(self.capacity);
                slot.insert(Sink { user, tx });
                debug!(user, "Presence: added");
                Ok(SinkReceiver { user, rx })
            }
        }
    }

    /// The user's sink, if connected here.
    #[must_use]
    pub fn get(&self, user: UserId) -> Option<Sink> {
        self.sinks.get(&user).map(|s| s.value().clone())
    }

    /// Drop the user's sink. Idempotent.
    pub fn remove(&self, user: UserId) {
        if self.sinks.remove(&user).is_some() {
            debug!(user, "Presence: removed");
        }
    }

    /// Number of users connected here.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SINK_CAPACITY)
    }
}
