//! Session lifecycle.
//!
//! A session spans one user's connection to this server:
//!
//! ```text
//! Connecting ──open──▶ Active ──disconnect / shutdown / write failure──▶ Closing ──▶ Closed
//! ```
//!
//! Opening adds the presence entry and then the directory row. Every exit
//! removes the presence entry and then the directory row, so that routing
//! never finds a sink whose stream is gone. Sessions are the only writers of
//! presence and directory entries.
//!
//! Opening and closing are serialized per user, so a reconnect waits for the
//! previous session's directory row to be gone before registering its own.

use crate::directory::{Directory, DirectoryError};
use crate::message::{ChatMessage, ServerId, UserId};
use crate::presence::{PresenceError, PresenceRegistry, SinkReceiver};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The user already has a session on this server.
    #[error("User {0} already has a session on this server")]
    AlreadyPresent(UserId),

    /// The directory rejected the registration.
    #[error("Could not register session: {0}")]
    DirectoryUnavailable(#[from] DirectoryError),

    /// The server is shutting down and accepts no new sessions.
    #[error("Server is shutting down")]
    ShuttingDown,
}

impl From<PresenceError> for SessionError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::AlreadyPresent(user) => SessionError::AlreadyPresent(user),
        }
    }
}

/// Failure writing to a client stream.
#[derive(Debug, Error)]
#[error("Outbound write failed: {0}")]
pub struct OutboundError(pub String);

/// The write half of a client's stream.
#[async_trait]
pub trait Outbound: Send {
    /// Write one message to the client.
    async fn deliver(&mut self, message: &ChatMessage) -> Result<(), OutboundError>;
}

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away.
    Cancelled,
    /// The server is shutting down.
    Shutdown,
    /// The sink stopped yielding messages.
    SinkClosed,
    /// Writing to the client failed.
    WriteFailed(String),
    /// Writing to the client took longer than `write_timeout`.
    WriteTimeout,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on one write to the client.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-user locks held while a session is being opened or torn down.
#[derive(Default)]
struct Handovers {
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl Handovers {
    async fn acquire(self: &Arc<Self>, user: UserId) -> HandoverGuard {
        let lock = Arc::clone(self.locks.entry(user).or_default().value());
        HandoverGuard {
            user,
            guard: Some(lock.lock_owned().await),
            handovers: Arc::clone(self),
        }
    }
}

struct HandoverGuard {
    user: UserId,
    guard: Option<OwnedMutexGuard<()>>,
    handovers: Arc<Handovers>,
}

impl Drop for HandoverGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: nobody holds or awaits the lock.
        self.handovers
            .locks
            .remove_if(&self.user, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Opens sessions and tears them all down on shutdown.
pub struct SessionManager {
    server_id: ServerId,
    presence: Arc<PresenceRegistry>,
    directory: Arc<dyn Directory>,
    handovers: Arc<Handovers>,
    config: SessionConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl SessionManager {
    /// Create a manager. Sessions are cancelled when `shutdown` fires.
    #[must_use]
    pub fn new(
        server_id: ServerId,
        presence: Arc<PresenceRegistry>,
        directory: Arc<dyn Directory>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            server_id,
            presence,
            directory,
            handovers: Arc::default(),
            config,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Open a session for `user`: add the presence entry, then register the
    /// directory row.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyPresent`] if the user already has a
    /// session here (the existing session is untouched),
    /// [`SessionError::DirectoryUnavailable`] if registration fails (the
    /// presence entry is rolled back) and [`SessionError::ShuttingDown`] once
    /// shutdown has started.
    ///
    /// Waits while an earlier session for the same user is still tearing down.
    pub async fn open(&self, user: UserId) -> Result<Session, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        debug!(user, state = ?SessionState::Connecting, "Opening session");

        let _handover = self.handovers.acquire(user).await;
        if self.shutdown.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }

        let receiver = self.presence.add(user)?;
        if let Err(e) = self.directory.register(self.server_id, user).await {
            self.presence.remove(user);
            warn!(user, error = %e, "Directory registration failed, session rejected");
            return Err(e.into());
        }

        info!(user, server = self.server_id, "Session active");
        Ok(Session {
            user,
            server_id: self.server_id,
            receiver,
            presence: Arc::clone(&self.presence),
            directory: Arc::clone(&self.directory),
            handovers: Arc::clone(&self.handovers),
            cancel: self.shutdown.child_token(),
            shutdown: self.shutdown.clone(),
            write_timeout: self.config.write_timeout,
            state: SessionState::Active,
            _tracked: self.tracker.token(),
        })
    }

    /// Sessions not yet closed.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.tracker.len()
    }

    /// Token cancelled when shutdown starts.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every session and wait up to `grace` for all of them to close.
    ///
    /// Returns `true` if every session closed in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(active = self.tracker.len(), "Shutting down sessions");
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("All sessions closed");
                true
            }
            Err(_) => {
                warn!(remaining = self.tracker.len(), "Sessions still open after grace period");
                false
            }
        }
    }
}

/// One user's connection on this server.
pub struct Session {
    user: UserId,
    server_id: ServerId,
    receiver: SinkReceiver,
    presence: Arc<PresenceRegistry>,
    directory: Arc<dyn Directory>,
    handovers: Arc<Handovers>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    write_timeout: Duration,
    state: SessionState,
    _tracked: TaskTrackerToken,
}

impl Session {
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token that ends this session when cancelled, e.g. on client disconnect.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the sink to `outbound` in push order until the session ends, then
    /// tear it down.
    pub async fn run<O>(mut self, outbound: &mut O) -> SessionEnd
    where
        O: Outbound + ?Sized,
    {
        let cancel = self.cancel.clone();
        let shutdown = self.shutdown.clone();
        let write_timeout = self.write_timeout;

        let end = loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break cancelled_end(&shutdown),

                next = self.receiver.recv() => {
                    let Some(message) = next else {
                        break SessionEnd::SinkClosed;
                    };
                    // A stalled write must not hold up a disconnect.
                    tokio::select! {
                        biased;

                        () = cancel.cancelled() => break cancelled_end(&shutdown),

                        written = tokio::time::timeout(write_timeout, outbound.deliver(&message)) => {
                            match written {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => break SessionEnd::WriteFailed(e.0),
                                Err(_) => break SessionEnd::WriteTimeout,
                            }
                        }
                    }
                }
            }
        };

        debug!(user = self.user, end = ?end, "Session ending");
        self.teardown().await;
        end
    }

    /// Tear down without draining, e.g. when the handshake reply could not be
    /// written.
    pub async fn close(mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        let _handover = self.handovers.acquire(self.user).await;

        // Buffered messages are discarded with the sink.
        self.receiver.close();
        self.presence.remove(self.user);
        if let Err(e) = self.directory.unregister(self.server_id, self.user).await {
            warn!(user = self.user, error = %e, "Directory unregister failed, row left behind");
        }

        self.state = SessionState::Closed;
        info!(user = self.user, "Session closed");
    }
}

fn cancelled_end(shutdown: &CancellationToken) -> SessionEnd {
    if shutdown.is_cancelled() {
        SessionEnd::Shutdown
    } else {
        SessionEnd::Cancelled
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        // The directory row stays behind; lookups that resolve back to this
        // server treat it as offline.
        self.presence.remove(self.user);
        warn!(user = self.user, "Session dropped without closing");
    }
}
