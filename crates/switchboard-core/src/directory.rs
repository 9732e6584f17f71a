//! Connection directory.
//!
//! The directory is the only state shared across server processes: one row
//! per connected user naming the server that owns the user's stream, plus one
//! row per running server with its client-facing address. It is consulted by
//! the router on a local miss and written only by sessions.
//!
//! There is no cross-process locking. Registration is an upsert, so the last
//! writer wins, and removal deletes only the exact (server, user) pair so a
//! stale owner cannot erase a newer owner's row.

use crate::message::{ServerId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backing store could not be reached.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// The store returned a row this client cannot interpret.
    #[error("Corrupt directory record: {0}")]
    Corrupt(String),
}

/// Ownership of one user's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub user: UserId,
    pub server: ServerId,
    /// Milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

/// A running server instance and the address clients reach it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: ServerId,
    pub address: String,
}

/// Accessor over the shared directory store.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Record `server` as the owner of `user`'s connection.
    async fn register(&self, server: ServerId, user: UserId) -> Result<(), DirectoryError>;

    /// Delete the record for exactly this pair. Deleting a missing record is not an error.
    async fn unregister(&self, server: ServerId, user: UserId) -> Result<(), DirectoryError>;

    /// Resolve the current owner of `user`. `None` means not connected anywhere.
    async fn lookup(&self, user: UserId) -> Result<Option<ServerId>, DirectoryError>;

    /// Publish a server's client-facing address.
    async fn register_server(&self, record: &ServerRecord) -> Result<(), DirectoryError>;

    /// Remove a server's address record.
    async fn unregister_server(&self, server: ServerId) -> Result<(), DirectoryError>;

    /// Client-facing address of a server, if registered.
    async fn server_address(&self, server: ServerId) -> Result<Option<String>, DirectoryError>;

    /// Number of connection records fleet-wide.
    async fn connection_count(&self) -> Result<u64, DirectoryError>;

    /// Release the underlying store handle.
    async fn close(&self) {}
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// In-process directory.
///
/// Serves single-node deployments and tests. Several routers sharing one
/// `MemoryDirectory` behave like a fleet sharing one store.
#[derive(Debug)]
pub struct MemoryDirectory {
    connections: DashMap<UserId, ConnectionRecord>,
    servers: DashMap<ServerId, ServerRecord>,
    available: AtomicBool,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            servers: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current record for a user.
    #[must_use]
    pub fn record(&self, user: UserId) -> Option<ConnectionRecord> {
        self.connections.get(&user).map(|r| r.value().clone())
    }

    fn check(&self) -> Result<(), DirectoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DirectoryError::Unavailable("memory directory offline".into()))
        }
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn register(&self, server: ServerId, user: UserId) -> Result<(), DirectoryError> {
        self.check()?;
        let record = ConnectionRecord {
            user,
            server,
            created_at_ms: now_ms(),
        };
        if let Some(previous) = self.connections.insert(user, record) {
            if previous.server != server {
                debug!(user, from = previous.server, to = server, "Directory: ownership moved");
            }
        }
        Ok(())
    }

    async fn unregister(&self, server: ServerId, user: UserId) -> Result<(), DirectoryError> {
        self.check()?;
        self.connections.remove_if(&user, |_, r| r.server == server);
        Ok(())
    }

    async fn lookup(&self, user: UserId) -> Result<Option<ServerId>, DirectoryError> {
        self.check()?;
        Ok(self.connections.get(&user).map(|r| r.server))
    }

    async fn register_server(&self, record: &ServerRecord) -> Result<(), DirectoryError> {
        self.check()?;
        self.servers.insert(record.id, record.clone());
        Ok(())
    }

    async fn unregister_server(&self, server: ServerId) -> Result<(), DirectoryError> {
        self.check()?;
        self.servers.remove(&server);
        Ok(())
    }

    async fn server_address(&self, server: ServerId) -> Result<Option<String>, DirectoryError> {
        self.check()?;
        Ok(self.servers.get(&server).map(|r| r.address.clone()))
    }

    async fn connection_count(&self) -> Result<u64, DirectoryError> {
        self.check()?;
        Ok(self.connections.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let dir = MemoryDirectory::new();

        dir.register(1, 7).await.unwrap();
        assert_eq!(dir.lookup(7).await.unwrap(), Some(1));
        assert_eq!(dir.connection_count().await.unwrap(), 1);

        dir.unregister(1, 7).await.unwrap();
        assert_eq!(dir.lookup(7).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_miss_is_not_an_error() {
        let dir = MemoryDirectory::new();
        assert!(matches!(dir.lookup(42).await, Ok(None)));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let dir = MemoryDirectory::new();
        dir.register(1, 7).await.unwrap();

        dir.unregister(1, 7).await.unwrap();
        dir.unregister(1, 7).await.unwrap();
        assert!(dir.record(7).is_none());
    }

    #[tokio::test]
    async fn test_last_writer_wins_and_stale_owner_cannot_delete() {
        let dir = MemoryDirectory::new();
        dir.register(1, 7).await.unwrap();
        dir.register(2, 7).await.unwrap();
        assert_eq!(dir.lookup(7).await.unwrap(), Some(2));

        // Server 1 tearing down its old session must not erase server 2's row.
        dir.unregister(1, 7).await.unwrap();
        assert_eq!(dir.lookup(7).await.unwrap(), Some(2));
        assert_eq!(dir.connection_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_records() {
        let dir = MemoryDirectory::new();
        let record = ServerRecord {
            id: 3,
            address: "ws://10.0.0.3:8080/ws".into(),
        };
        dir.register_server(&record).await.unwrap();
        assert_eq!(
            dir.server_address(3).await.unwrap().as_deref(),
            Some("ws://10.0.0.3:8080/ws")
        );

        dir.unregister_server(3).await.unwrap();
        assert_eq!(dir.server_address(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let dir = MemoryDirectory::new();
        dir.set_available(false);

        assert!(matches!(
            dir.register(1, 7).await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert!(dir.lookup(7).await.is_err());

        dir.set_available(true);
        assert!(dir.register(1, 7).await.is_ok());
    }
}
