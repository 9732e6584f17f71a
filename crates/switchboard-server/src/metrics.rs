//! Metrics collection and export for switchboard.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use switchboard_core::{RelayHandler, RouteOutcome, Router};
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "switchboard_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "switchboard_sessions_active";
    pub const ROUTED_TOTAL: &str = "switchboard_routed_total";
    pub const RELAY_RECEIVED_TOTAL: &str = "switchboard_relay_received_total";
    pub const ROUTE_LATENCY_SECONDS: &str = "switchboard_route_latency_seconds";
    pub const ERRORS_TOTAL: &str = "switchboard_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions opened since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of open sessions");
    metrics::describe_counter!(
        names::ROUTED_TOTAL,
        "Messages routed, labelled by outcome"
    );
    metrics::describe_counter!(
        names::RELAY_RECEIVED_TOTAL,
        "Messages received on this server's inbound relay topic"
    );
    metrics::describe_histogram!(
        names::ROUTE_LATENCY_SECONDS,
        "Time to route one message in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record one routing decision and how long it took.
pub fn record_route(outcome: &RouteOutcome, started: Instant) {
    counter!(names::ROUTED_TOTAL, "outcome" => outcome.label()).increment(1);
    histogram!(names::ROUTE_LATENCY_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that tracks an open session until dropped.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

/// Relay handler that counts inbound relay traffic before routing it.
pub struct MeteredRelayHandler {
    router: Arc<Router>,
}

impl MeteredRelayHandler {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl RelayHandler for MeteredRelayHandler {
    async fn handle(&self, payload: Bytes) {
        counter!(names::RELAY_RECEIVED_TOTAL).increment(1);
        let started = Instant::now();
        let outcome = self.router.route_envelope(&payload).await;
        record_route(&outcome, started);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::{DropReason, MemoryBroker, MemoryDirectory, PresenceRegistry, TopicScheme};

    #[test]
    fn test_metrics_guard() {
        // No recorder installed: recording is a no-op.
        let _guard = SessionMetricsGuard::new();
        record_route(&RouteOutcome::Dropped(DropReason::SinkFull), Instant::now());
    }

    #[tokio::test]
    async fn test_metered_handler_routes() {
        let presence = Arc::new(PresenceRegistry::default());
        let router = Arc::new(Router::new(
            1,
            Arc::clone(&presence),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryBroker::new()),
            TopicScheme::default(),
        ));
        let mut rx = presence.add(9).unwrap();

        let payload = switchboard_protocol::envelope::encode(
            &switchboard_core::ChatMessage::new(7, 9, "hi").to_envelope(),
        )
        .unwrap();
        MeteredRelayHandler::new(router).handle(payload).await;

        assert_eq!(rx.recv().await.unwrap().text(), "hi");
    }
}
