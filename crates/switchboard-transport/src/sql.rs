//! SQL connection directory.
//!
//! Two tables, shared by every server in the fleet:
//!
//! ```text
//! connections(c_id BIGINT PRIMARY KEY, s_id BIGINT NOT NULL, created_at BIGINT NOT NULL)
//! servers(s_id BIGINT PRIMARY KEY, s_url TEXT NOT NULL)
//! ```
//!
//! Runs on Postgres in production and on SQLite in tests, through the same
//! `sqlx::Any` pool.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::time::Duration;
use switchboard_core::directory::now_ms;
use switchboard_core::{Directory, DirectoryError, ServerId, ServerRecord, UserId};
use tracing::{debug, info};

const CREATE_CONNECTIONS: &str = "CREATE TABLE IF NOT EXISTS connections (
    c_id BIGINT PRIMARY KEY,
    s_id BIGINT NOT NULL,
    created_at BIGINT NOT NULL
)";

const CREATE_SERVERS: &str = "CREATE TABLE IF NOT EXISTS servers (
    s_id BIGINT PRIMARY KEY,
    s_url TEXT NOT NULL
)";

/// Pool settings.
#[derive(Debug, Clone)]
pub struct SqlDirectoryConfig {
    /// `postgres://..` or `sqlite:..` URL.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl SqlDirectoryConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// SQL-backed [`Directory`].
#[derive(Debug, Clone)]
pub struct SqlDirectory {
    pool: AnyPool,
}

impl SqlDirectory {
    /// Open a pool.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the database cannot be reached.
    pub async fn connect(config: &SqlDirectoryConfig) -> Result<Self, DirectoryError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(unavailable)?;
        info!(max_connections = config.max_connections, "Connected to directory database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Create the tables if missing.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unavailable`] if the statements fail.
    pub async fn migrate(&self) -> Result<(), DirectoryError> {
        sqlx::query(CREATE_CONNECTIONS)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        sqlx::query(CREATE_SERVERS)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        debug!("Directory tables ready");
        Ok(())
    }
}

fn unavailable(err: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(err.to_string())
}

fn id_column(row: &AnyRow, column: &str) -> Result<u32, DirectoryError> {
    let raw: i64 = row
        .try_get(column)
        .map_err(|e| DirectoryError::Corrupt(e.to_string()))?;
    u32::try_from(raw).map_err(|_| DirectoryError::Corrupt(format!("{column} out of range: {raw}")))
}

#[async_trait]
impl Directory for SqlDirectory {
    async fn register(&self, server: ServerId, user: UserId) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO connections (c_id, s_id, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (c_id) DO UPDATE SET s_id = excluded.s_id, created_at = excluded.created_at",
        )
        .bind(i64::from(user))
        .bind(i64::from(server))
        .bind(i64::try_from(now_ms()).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn unregister(&self, server: ServerId, user: UserId) -> Result<(), DirectoryError> {
        sqlx::query("DELETE FROM connections WHERE c_id = $1 AND s_id = $2")
            .bind(i64::from(user))
            .bind(i64::from(server))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn lookup(&self, user: UserId) -> Result<Option<ServerId>, DirectoryError> {
        let row = sqlx::query("SELECT s_id FROM connections WHERE c_id = $1")
            .bind(i64::from(user))
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.as_ref().map(|r| id_column(r, "s_id")).transpose()
    }

    async fn register_server(&self, record: &ServerRecord) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO servers (s_id, s_url) VALUES ($1, $2)
             ON CONFLICT (s_id) DO UPDATE SET s_url = excluded.s_url",
        )
        .bind(i64::from(record.id))
        .bind(record.address.as_str())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn unregister_server(&self, server: ServerId) -> Result<(), DirectoryError> {
        sqlx::query("DELETE FROM servers WHERE s_id = $1")
            .bind(i64::from(server))
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn server_address(&self, server: ServerId) -> Result<Option<String>, DirectoryError> {
        let row = sqlx::query("SELECT s_url FROM servers WHERE s_id = $1")
            .bind(i64::from(server))
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.map(|r| {
            r.try_get::<String, _>("s_url")
                .map_err(|e| DirectoryError::Corrupt(e.to_string()))
        })
        .transpose()
    }

    async fn connection_count(&self) -> Result<u64, DirectoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM connections")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| DirectoryError::Corrupt(e.to_string()))?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
