//! Message router.
//!
//! The router picks one delivery path per message: the recipient's local
//! sink when the recipient is connected to this server, otherwise the owning
//! server's inbound relay topic. Messages arriving from the relay are routed
//! again on the receiving server, which now finds the recipient locally.
//!
//! Nothing is retried here. A message that cannot be delivered is dropped and
//! the reason is returned to the caller for reporting. Senders never get a
//! delivery receipt.

use crate::directory::Directory;
use crate::message::{ChatMessage, ServerId};
use crate::presence::{PresenceRegistry, PushError};
use crate::relay::{RelayHandler, RelayTransport, TopicScheme};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use switchboard_protocol::envelope;
use tracing::{debug, info, trace, warn};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on waiting for the broker to accept a relayed message.
    pub publish_timeout: Duration,
    /// Relay every local miss to this server instead of asking the directory.
    pub static_peer: Option<ServerId>,
    /// Longest accepted message body in bytes.
    pub max_text_len: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(2),
            static_peer: None,
            max_text_len: 16 * 1024,
        }
    }
}

/// Why a message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Recipient id was `0`.
    Unaddressed,
    /// Body was empty.
    EmptyText,
    /// Body exceeded `max_text_len`.
    TooLong,
    /// Recipient is not connected anywhere.
    RecipientOffline,
    /// Recipient's sink is at capacity.
    SinkFull,
    /// Recipient's session is shutting down.
    SinkClosed,
    /// Directory lookup failed.
    DirectoryUnavailable,
    /// Broker did not accept the message in time.
    RelayPublishTimeout,
    /// Broker refused the message.
    RelayUnavailable,
    /// Relay payload could not be encoded or decoded.
    Malformed,
}

impl DropReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Unaddressed => "unaddressed",
            DropReason::EmptyText => "empty_text",
            DropReason::TooLong => "too_long",
            DropReason::RecipientOffline => "recipient_offline",
            DropReason::SinkFull => "sink_full",
            DropReason::SinkClosed => "sink_closed",
            DropReason::DirectoryUnavailable => "directory_unavailable",
            DropReason::RelayPublishTimeout => "relay_publish_timeout",
            DropReason::RelayUnavailable => "relay_unavailable",
            DropReason::Malformed => "malformed",
        }
    }
}

/// Result of routing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed into a local sink.
    Delivered,
    /// Accepted by the broker for the owning server.
    Relayed { server: ServerId },
    /// Not delivered.
    Dropped(DropReason),
}

impl RouteOutcome {
    /// Short label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Delivered => "delivered",
            RouteOutcome::Relayed { .. } => "relayed",
            RouteOutcome::Dropped(reason) => reason.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Relay,
}

/// Per-server message router.
pub struct Router {
    server_id: ServerId,
    presence: Arc<PresenceRegistry>,
    directory: Arc<dyn Directory>,
    relay: Arc<dyn RelayTransport>,
    topics: TopicScheme,
    config: RouterConfig,
}

impl Router {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new(
        server_id: ServerId,
        presence: Arc<PresenceRegistry>,
        directory: Arc<dyn Directory>,
        relay: Arc<dyn RelayTransport>,
        topics: TopicScheme,
    ) -> Self {
        Self::with_config(
            server_id,
            presence,
            directory,
            relay,
            topics,
            RouterConfig::default(),
        )
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(
        server_id: ServerId,
        presence: Arc<PresenceRegistry>,
        directory: Arc<dyn Directory>,
        relay: Arc<dyn RelayTransport>,
        topics: TopicScheme,
        config: RouterConfig,
    ) -> Self {
        info!(server = server_id, relay = relay.name(), "Creating router with config: {:?}", config);
        Self {
            server_id,
            presence,
            directory,
            relay,
            topics,
            config,
        }
    }

    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Topic this server's relay subscription listens on.
    #[must_use]
    pub fn inbound_topic(&self) -> String {
        self.topics.topic_for(self.server_id)
    }

    /// Route a message sent by a client connected to this server.
    pub async fn route(&self, message: ChatMessage) -> RouteOutcome {
        self.route_from(message, Origin::Client).await
    }

    /// Route a relay payload received on this server's inbound topic.
    ///
    /// A relayed message whose recipient is no longer here is dropped as
    /// offline; it is never relayed a second time.
    pub async fn route_envelope(&self, payload: &[u8]) -> RouteOutcome {
        match envelope::decode(payload) {
            Ok(env) => self.route_from(ChatMessage::from_envelope(env), Origin::Relay).await,
            Err(e) => {
                warn!(server = self.server_id, error = %e, "Dropping malformed relay payload");
                RouteOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    async fn route_from(&self, message: ChatMessage, origin: Origin) -> RouteOutcome {
        if message.is_unaddressed() {
            trace!(from = message.from(), "Dropping unaddressed message");
            return RouteOutcome::Dropped(DropReason::Unaddressed);
        }
        if message.text().is_empty() {
            trace!(from = message.from(), to = message.to(), "Dropping empty message");
            return RouteOutcome::Dropped(DropReason::EmptyText);
        }
        if message.text().len() > self.config.max_text_len {
            debug!(from = message.from(), to = message.to(), len = message.text().len(), "Dropping oversized message");
            return RouteOutcome::Dropped(DropReason::TooLong);
        }

        let to = message.to();
        if let Some(sink) = self.presence.get(to) {
            return match sink.push(message) {
                Ok(()) => {
                    trace!(to, "Delivered locally");
                    RouteOutcome::Delivered
                }
                Err(PushError::Full) => {
                    warn!(to, "Recipient sink full, dropping message");
                    RouteOutcome::Dropped(DropReason::SinkFull)
                }
                Err(PushError::Closed) => {
                    debug!(to, "Recipient sink closed, dropping message");
                    RouteOutcome::Dropped(DropReason::SinkClosed)
                }
            };
        }

        if origin == Origin::Relay {
            debug!(to, "Relayed message for a user no longer connected here");
            return RouteOutcome::Dropped(DropReason::RecipientOffline);
        }

        let target = match self.config.static_peer {
            Some(peer) => peer,
            None => match self.directory.lookup(to).await {
                Ok(Some(server)) => server,
                Ok(None) => {
                    debug!(to, "Recipient offline");
                    return RouteOutcome::Dropped(DropReason::RecipientOffline);
                }
                Err(e) => {
                    warn!(to, error = %e, "Directory lookup failed");
                    return RouteOutcome::Dropped(DropReason::DirectoryUnavailable);
                }
            },
        };

        if target == self.server_id {
            // Stale row left behind by a session that is already gone.
            debug!(to, "Directory points at this server but no sink exists");
            return RouteOutcome::Dropped(DropReason::RecipientOffline);
        }

        self.relay_to(target, &message).await
    }

    async fn relay_to(&self, target: ServerId, message: &ChatMessage) -> RouteOutcome {
        let payload = match envelope::encode(&message.to_envelope()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(to = message.to(), error = %e, "Failed to encode relay envelope");
                return RouteOutcome::Dropped(DropReason::Malformed);
            }
        };

        let topic = self.topics.topic_for(target);
        match tokio::time::timeout(self.config.publish_timeout, self.relay.publish(&topic, payload))
            .await
        {
            Ok(Ok(())) => {
                trace!(to = message.to(), topic = %topic, "Relayed");
                RouteOutcome::Relayed { server: target }
            }
            Ok(Err(e)) => {
                warn!(to = message.to(), topic = %topic, error = %e, "Relay publish failed");
                RouteOutcome::Dropped(DropReason::RelayUnavailable)
            }
            Err(_) => {
                warn!(to = message.to(), topic = %topic, "Relay publish timed out");
                RouteOutcome::Dropped(DropReason::RelayPublishTimeout)
            }
        }
    }
}

#[async_trait]
impl RelayHandler for Router {
    async fn handle(&self, payload: Bytes) {
        self.route_envelope(&payload).await;
    }
}
