//! Relay transport between server instances.
//!
//! Every server subscribes to its own inbound topic and publishes to the
//! inbound topics of its peers. Topics belong to a topic class (a broker-side
//! stream covering a wildcard pattern) that must be provisioned before
//! anything can be published.
//!
//! Delivery is at-least-once: a handler may see the same payload more than
//! once and must tolerate it.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::message::ServerId;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The broker could not be reached or refused the operation.
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// No provisioned topic class covers the topic.
    #[error("No topic class covers topic: {0}")]
    NoTopicClass(String),

    /// The topic already has an active subscription on this broker handle.
    #[error("Already subscribed to topic: {0}")]
    AlreadySubscribed(String),
}

/// Receives payloads delivered on a subscription.
///
/// Invocations for one subscription never overlap.
#[async_trait]
pub trait RelayHandler: Send + Sync {
    async fn handle(&self, payload: Bytes);
}

/// Durable topic-based publish/subscribe.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Provision the topic class `name` covering `pattern`. Idempotent.
    async fn ensure_topic_class(&self, name: &str, pattern: &str) -> Result<(), RelayError>;

    /// Hand a payload to the broker, returning once the broker has accepted it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError>;

    /// Start delivering `topic` to `handler` until `shutdown` fires.
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn RelayHandler>,
        shutdown: CancellationToken,
    ) -> Result<Subscription, RelayError>;

    /// Transport name for logs.
    fn name(&self) -> &'static str;
}

/// A running subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    #[must_use]
    pub fn new(topic: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            topic: topic.into(),
            handle,
        }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether the delivery loop has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the delivery loop to stop. Cancel its shutdown token first.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            debug!(topic = %self.topic, error = %e, "Relay subscription task ended abnormally");
        }
    }
}

/// Maps server ids to relay topics.
///
/// Injected as configuration so the relay layer never needs to know what the
/// directory contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    stream: String,
    prefix: String,
}

impl TopicScheme {
    /// `stream` names the topic class, `prefix` is the first topic token.
    #[must_use]
    pub fn new(stream: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            prefix: prefix.into(),
        }
    }

    /// Topic class name.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Wildcard covering every server's inbound topic.
    #[must_use]
    pub fn pattern(&self) -> String {
        format!("{}.*", self.prefix)
    }

    /// Inbound topic of `server`.
    #[must_use]
    pub fn topic_for(&self, server: ServerId) -> String {
        format!("{}.{}", self.prefix, server)
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("CHAT", "CHAT")
    }
}

/// Match a dot-separated subject against a pattern.
///
/// `*` matches exactly one token, a trailing `>` matches one or more.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct TopicQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    /// Taken by the active subscriber, returned when it stops.
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl TopicQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// In-process broker.
///
/// Payloads published while a topic has no subscriber are retained and
/// delivered once one subscribes, like a durable consumer. Share one broker
/// (behind an `Arc`) between routers to model several servers in one process.
pub struct MemoryBroker {
    classes: DashMap<String, String>,
    topics: Arc<DashMap<String, TopicQueue>>,
    available: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: DashMap::new(),
            topics: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether a topic class with this name exists.
    #[must_use]
    pub fn has_topic_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    fn check(&self) -> Result<(), RelayError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("memory broker offline".into()))
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayTransport for MemoryBroker {
    async fn ensure_topic_class(&self, name: &str, pattern: &str) -> Result<(), RelayError> {
        self.check()?;
        self.classes
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(class = %name, pattern = %pattern, "Created relay topic class");
                pattern.to_string()
            });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError> {
        self.check()?;
        if !self
            .classes
            .iter()
            .any(|class| subject_matches(class.value(), topic))
        {
            return Err(RelayError::NoTopicClass(topic.to_string()));
        }

        let queue = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicQueue::new);
        queue
            .tx
            .send(payload)
            .map_err(|_| RelayError::Unavailable(format!("topic {} queue closed", topic)))?;
        trace!(topic = %topic, "Relay: published");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn RelayHandler>,
        shutdown: CancellationToken,
    ) -> Result<Subscription, RelayError> {
        self.check()?;
        let mut rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicQueue::new)
            .rx
            .take()
            .ok_or_else(|| RelayError::AlreadySubscribed(topic.to_string()))?;

        let topics = Arc::clone(&self.topics);
        let name = topic.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => break,

                    next = rx.recv() => match next {
                        Some(payload) => handler.handle(payload).await,
                        None => break,
                    },
                }
            }

            // Undelivered payloads stay queued for the next subscriber.
            if let Some(mut queue) = topics.get_mut(&name) {
                queue.rx = Some(rx);
            }
            debug!(topic = %name, "Relay subscription stopped");
        });

        debug!(topic = %topic, "Relay subscription started");
        Ok(Subscription::new(topic, handle))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Collect(mpsc::UnboundedSender<Bytes>);

    #[async_trait]
    impl RelayHandler for Collect {
        async fn handle(&self, payload: Bytes) {
            let _ = self.0.send(payload);
        }
    }

    fn collector() -> (Arc<dyn RelayHandler>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collect(tx)), rx)
    }

    #[test]
    fn test_subject_matches() {
        assert!(subject_matches("CHAT.*", "CHAT.2"));
        assert!(!subject_matches("CHAT.*", "CHAT"));
        assert!(!subject_matches("CHAT.*", "CHAT.2.x"));
        assert!(subject_matches("CHAT.>", "CHAT.2.x"));
        assert!(!subject_matches("CHAT.>", "CHAT"));
        assert!(subject_matches("CHAT.2", "CHAT.2"));
        assert!(!subject_matches("CHAT.2", "CHAT.3"));
    }

    #[test]
    fn test_topic_scheme() {
        let scheme = TopicScheme::new("CHAT", "CHAT");
        assert_eq!(scheme.topic_for(2), "CHAT.2");
        assert_eq!(scheme.pattern(), "CHAT.*");
        assert!(subject_matches(&scheme.pattern(), &scheme.topic_for(17)));
    }

    #[tokio::test]
    async fn test_publish_requires_topic_class() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("CHAT.2", Bytes::from_static(b"x")).await,
            Err(RelayError::NoTopicClass(_))
        ));

        broker.ensure_topic_class("CHAT", "CHAT.*").await.unwrap();
        broker.ensure_topic_class("CHAT", "CHAT.*").await.unwrap();
        assert!(broker.has_topic_class("CHAT"));
        assert!(broker.publish("CHAT.2", Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_retained_until_subscribed_and_in_order() {
        let broker = MemoryBroker::new();
        broker.ensure_topic_class("CHAT", "CHAT.*").await.unwrap();

        for i in 0..3u8 {
            broker.publish("CHAT.2", Bytes::from(vec![i])).await.unwrap();
        }

        let (handler, mut rx) = collector();
        let shutdown = CancellationToken::new();
        let sub = broker
            .subscribe("CHAT.2", handler, shutdown.clone())
            .await
            .unwrap();
        assert_eq!(sub.topic(), "CHAT.2");

        for i in 0..3u8 {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&got[..], &[i]);
        }

        shutdown.cancel();
        sub.join().await;
    }

    #[tokio::test]
    async fn test_resubscribe_after_shutdown() {
        let broker = MemoryBroker::new();
        broker.ensure_topic_class("CHAT", "CHAT.*").await.unwrap();

        let (handler, _rx) = collector();
        let first = CancellationToken::new();
        let sub = broker
            .subscribe("CHAT.1", Arc::clone(&handler), first.clone())
            .await
            .unwrap();

        assert!(matches!(
            broker
                .subscribe("CHAT.1", Arc::clone(&handler), CancellationToken::new())
                .await,
            Err(RelayError::AlreadySubscribed(_))
        ));

        first.cancel();
        sub.join().await;

        broker.publish("CHAT.1", Bytes::from_static(b"later")).await.unwrap();
        let (handler, mut rx) = collector();
        let second = CancellationToken::new();
        let sub = broker
            .subscribe("CHAT.1", handler, second.clone())
            .await
            .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"later");
        second.cancel();
        sub.join().await;
    }

    #[tokio::test]
    async fn test_unavailable_broker() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(
            broker.ensure_topic_class("CHAT", "CHAT.*").await,
            Err(RelayError::Unavailable(_))
        ));
    }
}
