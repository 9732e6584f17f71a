//! Connection handlers for the switchboard server.
//!
//! This module handles the server lifecycle, the WebSocket session protocol
//! and message intake.

use crate::bootstrap;
use crate::config::Config;
use crate::metrics::{self, MeteredRelayHandler, SessionMetricsGuard};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router as HttpRouter,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_core::{
    ChatMessage, Directory, Outbound, OutboundError, PresenceRegistry, RelayHandler,
    RelayTransport, Router, ServerRecord, SessionEnd, SessionError, SessionManager, Subscription,
    UserId, UNADDRESSED,
};
use switchboard_protocol::{codec, codes, Frame, PROTOCOL_VERSION};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The message router.
    pub router: Arc<Router>,
    /// Opens and tears down sessions.
    pub sessions: SessionManager,
}

/// A bound server, ready to serve.
pub struct Server {
    state: Arc<AppState>,
    listener: TcpListener,
    directory: Arc<dyn Directory>,
    subscription: Subscription,
    shutdown: CancellationToken,
}

impl Server {
    /// Connect the configured backends and bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend is unreachable or the address is taken.
    pub async fn bind(config: Config) -> Result<Self> {
        let directory = bootstrap::connect_directory(&config.directory).await?;
        let relay = bootstrap::connect_relay(&config).await?;
        Self::with_backends(config, directory, relay).await
    }

    /// Bind against already connected backends.
    ///
    /// # Errors
    ///
    /// Returns an error if the server record cannot be written, the inbound
    /// subscription fails or the address is taken.
    pub async fn with_backends(
        config: Config,
        directory: Arc<dyn Directory>,
        relay: Arc<dyn RelayTransport>,
    ) -> Result<Self> {
        let server_id = config.server_id;

        let record = ServerRecord {
            id: server_id,
            address: config.advertised_url(),
        };
        directory
            .register_server(&record)
            .await
            .context("Unable to register server in directory")?;
        info!(server = server_id, address = %record.address, "Registered server");

        match directory.connection_count().await {
            Ok(count) => info!("There are {} connections across the fleet", count),
            Err(e) => warn!(error = %e, "Unable to count connections"),
        }

        let presence = Arc::new(PresenceRegistry::new(config.session.sink_capacity));
        let router = Arc::new(Router::with_config(
            server_id,
            Arc::clone(&presence),
            Arc::clone(&directory),
            Arc::clone(&relay),
            config.topics(),
            config.router_config(),
        ));

        let shutdown = CancellationToken::new();
        let sessions = SessionManager::new(
            server_id,
            presence,
            Arc::clone(&directory),
            config.session_config(),
            shutdown.clone(),
        );

        let inbound = config
            .relay
            .inbound_topic
            .clone()
            .unwrap_or_else(|| router.inbound_topic());
        let handler: Arc<dyn RelayHandler> = Arc::new(MeteredRelayHandler::new(Arc::clone(&router)));
        let subscription = relay
            .subscribe(&inbound, handler, shutdown.child_token())
            .await
            .with_context(|| format!("Unable to subscribe to {inbound}"))?;

        let addr = config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Unable to bind {addr}"))?;

        Ok(Self {
            state: Arc::new(AppState {
                config,
                router,
                sessions,
            }),
            listener,
            directory,
            subscription,
            shutdown,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancelling this token shuts the server down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires, then close every session, stop
    /// the relay subscription and remove this server from the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails.
    pub async fn serve(self) -> Result<()> {
        let Self {
            state,
            listener,
            directory,
            subscription,
            shutdown,
        } = self;
        let config = &state.config;

        info!("switchboard server {} listening on {}", config.server_id, listener.local_addr()?);
        info!("WebSocket endpoint: {}", config.advertised_url());

        let app = build_app(Arc::clone(&state));
        let signal = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await?;

        info!("Listener closed, draining sessions");
        let grace = Duration::from_millis(config.session.shutdown_grace_ms);
        if !state.sessions.shutdown(grace).await {
            metrics::record_error("shutdown_grace_exceeded");
        }

        shutdown.cancel();
        subscription.join().await;

        if let Err(e) = directory.unregister_server(config.server_id).await {
            warn!(error = %e, "Unable to unregister server from directory");
        } else {
            info!(server = config.server_id, "Unregistered server");
        }
        directory.close().await;
        Ok(())
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let server = Server::bind(config).await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!(error = %e, "Unable to listen for Ctrl-C, shutting down"),
        }
        shutdown.cancel();
    });

    server.serve().await
}

/// Build the HTTP routes.
pub fn build_app(state: Arc<AppState>) -> HttpRouter {
    HttpRouter::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "server_id": state.config.server_id,
        "sessions": state.sessions.active_sessions(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(codec::MAX_FRAME_SIZE + codec::LENGTH_PREFIX_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection from handshake to teardown.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    let Some(user) = handshake(&state, &mut sender, &mut receiver, &mut read_buffer).await else {
        return;
    };

    let session = match state.sessions.open(user).await {
        Ok(session) => session,
        Err(e) => {
            let code = match e {
                SessionError::AlreadyPresent(_) => codes::ALREADY_CONNECTED,
                SessionError::DirectoryUnavailable(_) => codes::DIRECTORY_UNAVAILABLE,
                SessionError::ShuttingDown => codes::SHUTTING_DOWN,
            };
            reject(&mut sender, code, e.to_string()).await;
            return;
        }
    };
    let _metrics_guard = SessionMetricsGuard::new();

    let connected = Frame::connected(
        state.config.server_id,
        PROTOCOL_VERSION.major,
        state.config.session.heartbeat_ms,
    );
    if let Err(e) = send_frame(&mut sender, &connected).await {
        warn!(user, error = %e, "Failed to send Connected frame");
        session.close().await;
        return;
    }

    let sender: WsSender = Arc::new(Mutex::new(sender));
    let cancel = session.cancel_token();
    let reader = tokio::spawn(read_loop(
        user,
        receiver,
        read_buffer,
        Arc::clone(&state),
        Arc::clone(&sender),
        cancel.clone(),
    ));

    let mut outbound = WsOutbound {
        sender: Arc::clone(&sender),
    };
    let end = session.run(&mut outbound).await;
    cancel.cancel();
    if let Err(e) = reader.await {
        debug!(user, error = %e, "Reader task ended abnormally");
    }

    let mut sender = sender.lock().await;
    match &end {
        SessionEnd::Shutdown => {
            let notice = Frame::error(codes::SHUTTING_DOWN, "Server shutting down");
            if let Err(e) = send_frame(&mut sender, &notice).await {
                debug!(user, error = %e, "Could not send shutdown notice");
            }
        }
        SessionEnd::WriteFailed(e) => {
            debug!(user, error = %e, "Client write failed");
            metrics::record_error("write_failed");
        }
        SessionEnd::WriteTimeout => {
            warn!(user, "Client write timed out");
            metrics::record_error("write_timeout");
        }
        SessionEnd::Cancelled | SessionEnd::SinkClosed => {}
    }
    if let Err(e) = sender.close().await {
        debug!(user, error = %e, "WebSocket close failed");
    }

    debug!(user, end = ?end, "WebSocket disconnected");
}

/// Read the `Connect` frame and check it. Rejected clients get an `Error`
/// frame and `None`.
async fn handshake(
    state: &AppState,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<UserId> {
    let limit = Duration::from_millis(state.config.session.handshake_timeout_ms);

    match tokio::time::timeout(limit, next_frame(receiver, read_buffer)).await {
        Ok(Ok(Some(Frame::Connect { version, user_id }))) => {
            if !PROTOCOL_VERSION.accepts_major(version) {
                reject(
                    sender,
                    codes::UNSUPPORTED_VERSION,
                    format!("Unsupported protocol version {version}, server speaks {}", PROTOCOL_VERSION.major),
                )
                .await;
                None
            } else if user_id == UNADDRESSED {
                reject(sender, codes::BAD_HANDSHAKE, "User id 0 is reserved").await;
                None
            } else {
                debug!(user = user_id, "Handshake complete");
                Some(user_id)
            }
        }
        Ok(Ok(Some(other))) => {
            reject(
                sender,
                codes::BAD_HANDSHAKE,
                format!("Expected Connect, got {:?}", other.frame_type()),
            )
            .await;
            None
        }
        Ok(Ok(None)) => {
            debug!("Client left before handshake");
            None
        }
        Ok(Err(e)) => {
            reject(sender, codes::BAD_HANDSHAKE, e.to_string()).await;
            None
        }
        Err(_) => {
            reject(sender, codes::BAD_HANDSHAKE, "Handshake timed out").await;
            None
        }
    }
}

/// Route every `Send` frame from the client until it leaves or the session
/// is cancelled.
async fn read_loop(
    user: UserId,
    mut receiver: SplitStream<WebSocket>,
    mut read_buffer: BytesMut,
    state: Arc<AppState>,
    sender: WsSender,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            frame = next_frame(&mut receiver, &mut read_buffer) => frame,
        };

        match frame {
            Ok(Some(Frame::Send { from, to, text })) => {
                if from != user {
                    debug!(user, claimed = from, "Send frame names another sender, using session user");
                }
                let started = Instant::now();
                let outcome = state.router.route(ChatMessage::new(user, to, text)).await;
                metrics::record_route(&outcome, started);
            }
            Ok(Some(Frame::Ping { timestamp })) => {
                let mut sender = sender.lock().await;
                if send_frame(&mut sender, &Frame::pong(timestamp)).await.is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Pong { .. })) => {}
            Ok(Some(other)) => {
                warn!(user, frame_type = ?other.frame_type(), "Unexpected frame type");
            }
            Ok(None) => {
                debug!(user, "WebSocket stream ended");
                break;
            }
            Err(e) => {
                warn!(user, error = %e, "WebSocket read error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    // Client gone: end the session.
    cancel.cancel();
}

/// Next complete frame from the client. `None` once the client closes.
async fn next_frame(
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = codec::decode_from(read_buffer)? {
            return Ok(Some(frame));
        }

        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => read_buffer.extend_from_slice(&data),
            Some(Ok(Message::Text(text))) => {
                // Treat text as binary
                read_buffer.extend_from_slice(text.as_bytes());
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {
                // Ping/pong handled by the WebSocket layer
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Send an error frame and close the stream.
async fn reject(sender: &mut SplitSink<WebSocket, Message>, code: u16, message: impl Into<String>) {
    let message = message.into();
    debug!(code, message = %message, "Rejecting connection");
    if let Err(e) = send_frame(sender, &Frame::error(code, message)).await {
        debug!(code, error = %e, "Could not send rejection");
    }
    if let Err(e) = sender.close().await {
        debug!(code, error = %e, "WebSocket close failed");
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Writes delivered messages to the client as `Deliver` frames.
struct WsOutbound {
    sender: WsSender,
}

#[async_trait]
impl Outbound for WsOutbound {
    async fn deliver(&mut self, message: &ChatMessage) -> Result<(), OutboundError> {
        let frame = Frame::deliver(message.from(), message.text());
        let mut sender = self.sender.lock().await;
        send_frame(&mut sender, &frame)
            .await
            .map_err(|e| OutboundError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayKind;
    use switchboard_core::{MemoryBroker, MemoryDirectory};
    use switchboard_transport::{ChatClient, TransportError};
    use tokio::task::JoinHandle;

    fn test_config(server_id: u32) -> Config {
        let mut config = Config::default();
        config.server_id = server_id;
        config.host = "127.0.0.1".into();
        config.port = 0;
        config.directory.url = None;
        config.relay.kind = RelayKind::Memory;
        config.relay.static_peer = None;
        config.metrics.enabled = false;
        config.session.shutdown_grace_ms = 1_000;
        config
    }

    struct Running {
        url: String,
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    async fn start(
        config: Config,
        directory: Arc<MemoryDirectory>,
        broker: Arc<MemoryBroker>,
    ) -> Running {
        let topics = config.topics();
        broker
            .ensure_topic_class(topics.stream(), &topics.pattern())
            .await
            .unwrap();
        let server = Server::with_backends(config, directory, broker).await.unwrap();
        let url = format!("ws://{}/ws", server.local_addr().unwrap());
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.serve());
        Running {
            url,
            shutdown,
            task,
        }
    }

    async fn recv(client: &mut ChatClient) -> ChatMessage {
        tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("timed out waiting for delivery")
            .unwrap()
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_end_to_end_single_server() {
        let directory = Arc::new(MemoryDirectory::new());
        let server = start(test_config(1), Arc::clone(&directory), Arc::new(MemoryBroker::new())).await;

        let mut alice = ChatClient::connect(&server.url, 7).await.unwrap();
        let mut bob = ChatClient::connect(&server.url, 9).await.unwrap();
        assert_eq!(alice.server_id(), 1);

        alice.send(9, "hi").await.unwrap();
        assert_eq!(recv(&mut bob).await, ChatMessage::new(7, 9, "hi"));

        bob.send(7, "hello").await.unwrap();
        assert_eq!(recv(&mut alice).await.text(), "hello");

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
        assert_eq!(directory.connection_count().await.unwrap(), 0);
        assert_eq!(directory.server_address(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_end_to_end_across_servers() {
        let directory = Arc::new(MemoryDirectory::new());
        let broker = Arc::new(MemoryBroker::new());
        let one = start(test_config(1), Arc::clone(&directory), Arc::clone(&broker)).await;
        let two = start(test_config(2), Arc::clone(&directory), Arc::clone(&broker)).await;

        let mut seven = ChatClient::connect(&one.url, 7).await.unwrap();
        let mut nine = ChatClient::connect(&two.url, 9).await.unwrap();
        assert_eq!(directory.lookup(9).await.unwrap(), Some(2));

        seven.send(9, "hi").await.unwrap();
        let got = recv(&mut nine).await;
        assert_eq!((got.from(), got.text()), (7, "hi"));

        // No receipt flows back to the sender.
        let quiet = tokio::time::timeout(Duration::from_millis(100), seven.recv()).await;
        assert!(quiet.is_err());

        one.shutdown.cancel();
        two.shutdown.cancel();
        one.task.await.unwrap().unwrap();
        two.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let server = start(
            test_config(1),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryBroker::new()),
        )
        .await;

        let mut first = ChatClient::connect(&server.url, 7).await.unwrap();
        match ChatClient::connect(&server.url, 7).await {
            Err(TransportError::Rejected { code, .. }) => assert_eq!(code, codes::ALREADY_CONNECTED),
            other => panic!("expected rejection, got {:?}", other.map(|c| c.server_id())),
        }

        // The existing session still works.
        let mut other = ChatClient::connect(&server.url, 8).await.unwrap();
        other.send(7, "still here?").await.unwrap();
        assert_eq!(recv(&mut first).await.text(), "still here?");

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reserved_user_id_rejected() {
        let server = start(
            test_config(1),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryBroker::new()),
        )
        .await;

        assert!(matches!(
            ChatClient::connect(&server.url, UNADDRESSED).await,
            Err(TransportError::Rejected { code: codes::BAD_HANDSHAKE, .. })
        ));

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_clears_directory() {
        let directory = Arc::new(MemoryDirectory::new());
        let server = start(test_config(1), Arc::clone(&directory), Arc::new(MemoryBroker::new())).await;

        let client = ChatClient::connect(&server.url, 7).await.unwrap();
        assert_eq!(directory.lookup(7).await.unwrap(), Some(1));

        let (mut tx, _rx) = client.split();
        tx.close().await.unwrap();

        let mut cleared = false;
        for _ in 0..50 {
            if directory.lookup(7).await.unwrap().is_none() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleared);

        server.shutdown.cancel();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_notifies_clients() {
        let server = start(
            test_config(1),
            Arc::new(MemoryDirectory::new()),
            Arc::new(MemoryBroker::new()),
        )
        .await;
        let mut client = ChatClient::connect(&server.url, 7).await.unwrap();

        server.shutdown.cancel();
        match tokio::time::timeout(Duration::from_secs(2), client.recv()).await {
            Ok(Err(TransportError::Rejected { code, .. })) => assert_eq!(code, codes::SHUTTING_DOWN),
            Ok(Ok(None)) => {}
            other => panic!("unexpected result: {:?}", other.map(|r| r.map(|m| m.map(|m| m.text().to_string())))),
        }
        server.task.await.unwrap().unwrap();
    }
}
