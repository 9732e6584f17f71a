//! Connects the directory and relay backends named in the configuration.

use crate::config::{Config, DirectoryConfig, RelayKind};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{Directory, MemoryBroker, MemoryDirectory, RelayTransport};
use switchboard_transport::{JetStreamRelay, SqlDirectory, SqlDirectoryConfig};
use tracing::{info, warn};

/// Durable consumer name prefix on the broker.
const CONSUMER_PREFIX: &str = "switchboard";

/// Connect to the directory store, creating its tables if needed.
///
/// # Errors
///
/// Returns an error if the store cannot be reached.
pub async fn connect_directory(config: &DirectoryConfig) -> Result<Arc<dyn Directory>> {
    let Some(url) = &config.url else {
        warn!("No directory URL configured, using in-process directory (single node only)");
        return Ok(Arc::new(MemoryDirectory::new()));
    };

    let sql_config = SqlDirectoryConfig {
        url: url.clone(),
        max_connections: config.max_connections,
        acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
    };
    let directory = SqlDirectory::connect(&sql_config)
        .await
        .context("Unable to connect to directory database")?;
    directory
        .migrate()
        .await
        .context("Unable to prepare directory tables")?;
    Ok(Arc::new(directory))
}

/// Connect to the relay broker and provision the topic class every server's
/// inbound topic belongs to.
///
/// # Errors
///
/// Returns an error if the broker cannot be reached or refuses the topic class.
pub async fn connect_relay(config: &Config) -> Result<Arc<dyn RelayTransport>> {
    let relay: Arc<dyn RelayTransport> = match config.relay.kind {
        RelayKind::Memory => {
            warn!("Using in-process relay broker (single node only)");
            Arc::new(MemoryBroker::new())
        }
        RelayKind::Jetstream => Arc::new(
            JetStreamRelay::connect(&config.relay.url, CONSUMER_PREFIX)
                .await
                .context("Unable to connect to relay broker")?,
        ),
    };

    let topics = config.topics();
    relay
        .ensure_topic_class(topics.stream(), &topics.pattern())
        .await
        .with_context(|| format!("Unable to provision relay stream {}", topics.stream()))?;
    info!(
        relay = relay.name(),
        stream = topics.stream(),
        pattern = %topics.pattern(),
        "Relay ready"
    );
    Ok(relay)
}
