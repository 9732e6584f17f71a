//! NATS JetStream relay.
//!
//! Topic classes map to JetStream streams, topics to subjects. Each server
//! reads its inbound subject through a durable pull consumer, so messages
//! published while it is down are delivered once it comes back. A message is
//! acknowledged only after the handler returns; anything unacknowledged is
//! redelivered by the broker.

use async_nats::jetstream::{self, consumer::pull, stream};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{subject_matches, RelayError, RelayHandler, RelayTransport, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause after a failed pull before trying again.
const PULL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// JetStream-backed [`RelayTransport`].
pub struct JetStreamRelay {
    context: jetstream::Context,
    consumer_prefix: String,
    /// Provisioned stream name -> subject pattern.
    classes: DashMap<String, String>,
}

impl JetStreamRelay {
    /// Connect to the NATS server at `url`.
    ///
    /// Durable consumers are named `<consumer_prefix>-<topic>`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unavailable`] if the server cannot be reached.
    pub async fn connect(url: &str, consumer_prefix: impl Into<String>) -> Result<Self, RelayError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| RelayError::Unavailable(format!("connect {url}: {e}")))?;
        info!(url = %url, "Connected to NATS");
        Ok(Self::with_client(client, consumer_prefix))
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn with_client(client: async_nats::Client, consumer_prefix: impl Into<String>) -> Self {
        Self {
            context: jetstream::new(client),
            consumer_prefix: consumer_prefix.into(),
            classes: DashMap::new(),
        }
    }

    fn stream_for(&self, topic: &str) -> Result<String, RelayError> {
        self.classes
            .iter()
            .find(|class| subject_matches(class.value(), topic))
            .map(|class| class.key().clone())
            .ok_or_else(|| RelayError::NoTopicClass(topic.to_string()))
    }
}

/// Durable consumer name for `topic`. Consumer names may not contain '.',
/// '*' or '>'.
fn durable_name(prefix: &str, topic: &str) -> String {
    let topic: String = topic
        .chars()
        .map(|c| if matches!(c, '.' | '*' | '>') { '_' } else { c })
        .collect();
    format!("{prefix}-{topic}")
}

#[async_trait]
impl RelayTransport for JetStreamRelay {
    async fn ensure_topic_class(&self, name: &str, pattern: &str) -> Result<(), RelayError> {
        self.context
            .get_or_create_stream(stream::Config {
                name: name.to_string(),
                subjects: vec![pattern.to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| RelayError::Unavailable(format!("stream {name}: {e}")))?;

        self.classes.insert(name.to_string(), pattern.to_string());
        debug!(stream = %name, pattern = %pattern, "JetStream stream ready");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
        let ack = self
            .context
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| RelayError::Unavailable(e.to_string()))?;
        ack.await.map_err(|e| RelayError::Unavailable(e.to_string()))?;
        trace!(topic = %topic, "Published to JetStream");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn RelayHandler>,
        shutdown: CancellationToken,
    ) -> Result<Subscription, RelayError> {
        let stream_name = self.stream_for(topic)?;
        let durable = durable_name(&self.consumer_prefix, topic);

        let stream = self
            .context
            .get_stream(&stream_name)
            .await
            .map_err(|e| RelayError::Unavailable(format!("stream {stream_name}: {e}")))?;
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: topic.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RelayError::Unavailable(format!("consumer {durable}: {e}")))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| RelayError::Unavailable(format!("consumer {durable}: {e}")))?;

        let name = topic.to_string();
        let handle = tokio::spawn(async move {
            let mut messages = Box::pin(messages);
            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => break,

                    next = messages.next() => match next {
                        Some(Ok(message)) => {
                            handler.handle(message.payload.clone()).await;
                            if let Err(e) = message.ack().await {
                                warn!(topic = %name, error = %e, "Failed to ack relay message");
                            }
                        }
                        Some(Err(e)) => {
                            warn!(topic = %name, error = %e, "JetStream pull failed");
                            tokio::time::sleep(PULL_RETRY_DELAY).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(topic = %name, "JetStream subscription stopped");
        });

        info!(topic = %topic, consumer = %durable, "JetStream subscription started");
        Ok(Subscription::new(topic, handle))
    }

    fn name(&self) -> &'static str {
        "jetstream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_name_is_valid_consumer_name() {
        assert_eq!(durable_name("switchboard", "CHAT.2"), "switchboard-CHAT_2");
        assert_eq!(durable_name("sb", "CHAT.*"), "sb-CHAT__");
        assert!(!durable_name("sb", "a.b.>").contains(['.', '*', '>']));
    }
}
