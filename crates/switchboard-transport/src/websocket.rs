//! WebSocket chat client.
//!
//! Speaks the framed protocol over `tokio-tungstenite`: a `Connect` frame,
//! the server's `Connected` reply, then `Send` frames out and `Deliver`
//! frames in.

use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use switchboard_core::{ChatMessage, ServerId, UserId};
use switchboard_protocol::{codec, Frame, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use crate::error::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Cap on one incoming WebSocket message: one full frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = codec::MAX_FRAME_SIZE + codec::LENGTH_PREFIX_SIZE;

/// A connected chat session.
pub struct ChatClient {
    server_id: ServerId,
    heartbeat_ms: u32,
    sender: ChatSender,
    receiver: ChatReceiver,
}

impl ChatClient {
    /// Connect to `url` and open a session for `user`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] if the stream cannot be opened
    /// or the reply is not `Connected`, and [`TransportError::Rejected`] if
    /// the server refuses the session.
    pub async fn connect(url: &str, user: UserId) -> Result<Self, TransportError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let (sink, stream) = ws.split();

        let mut sender = ChatSender { user, sink };
        let mut receiver = ChatReceiver {
            user,
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        };

        sender
            .send_frame(&Frame::connect(PROTOCOL_VERSION.major, user))
            .await?;

        match receiver.next_frame().await? {
            Some(Frame::Connected {
                server_id,
                heartbeat,
                ..
            }) => {
                debug!(user, server_id, "Session established");
                Ok(Self {
                    server_id,
                    heartbeat_ms: heartbeat,
                    sender,
                    receiver,
                })
            }
            Some(Frame::Error { code, message }) => Err(TransportError::Rejected { code, message }),
            Some(other) => Err(TransportError::Handshake(format!(
                "expected Connected, got {:?}",
                other.frame_type()
            ))),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Server now owning this user's connection.
    #[must_use]
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Recommended ping interval in milliseconds.
    #[must_use]
    pub fn heartbeat_ms(&self) -> u32 {
        self.heartbeat_ms
    }

    /// Send a chat message to `to`. There is no delivery receipt.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send(&mut self, to: UserId, text: impl Into<String>) -> Result<(), TransportError> {
        self.sender.send(to, text).await
    }

    /// Next delivered message. `None` once the server closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error on a broken stream, a malformed frame or an error
    /// frame from the server.
    pub async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        self.receiver.recv().await
    }

    /// Split into halves usable from separate tasks.
    #[must_use]
    pub fn split(self) -> (ChatSender, ChatReceiver) {
        (self.sender, self.receiver)
    }
}

/// Write half of a chat session.
pub struct ChatSender {
    user: UserId,
    sink: SplitSink<WsStream, Message>,
}

impl ChatSender {
    /// Send a chat message to `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send(&mut self, to: UserId, text: impl Into<String>) -> Result<(), TransportError> {
        self.send_frame(&Frame::send(self.user, to, text)).await
    }

    /// Send a keepalive ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn ping(&mut self) -> Result<(), TransportError> {
        self.send_frame(&Frame::ping()).await
    }

    /// Close the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake cannot be written.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let data = codec::encode(frame)?;
        self.sink
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Read half of a chat session.
pub struct ChatReceiver {
    user: UserId,
    stream: SplitStream<WsStream>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl ChatReceiver {
    /// Next delivered message. `None` once the server closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error on a broken stream, a malformed frame or an error
    /// frame from the server.
    pub async fn recv(&mut self) -> Result<Option<ChatMessage>, TransportError> {
        loop {
            match self.next_frame().await? {
                Some(Frame::Deliver { from, text }) => {
                    return Ok(Some(ChatMessage::new(from, self.user, text)));
                }
                Some(Frame::Error { code, message }) => {
                    return Err(TransportError::Rejected { code, message });
                }
                Some(Frame::Pong { .. }) => {}
                Some(other) => {
                    debug!(frame = ?other.frame_type(), "Ignoring unexpected frame");
                }
                None => return Ok(None),
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
            return Ok(Some(frame));
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        warn!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(
                            switchboard_protocol::ProtocolError::FrameTooLarge(data.len()),
                        ));
                    }
                    self.read_buffer.extend_from_slice(&data);
                    if let Some(frame) = codec::decode_from(&mut self.read_buffer)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Ok(_)) => {
                    // Control frames are answered by tungstenite itself.
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_protocol::codes;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn read_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => return codec::decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn write_frame(ws: &mut WebSocketStream<TcpStream>, frame: &Frame) {
        let data = codec::encode(frame).unwrap();
        ws.send(Message::Binary(data.to_vec())).await.unwrap();
    }

    /// Accept one connection and run `script` against it.
    async fn serve_once<F, Fut>(script: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn test_handshake_send_and_deliver() {
        let url = serve_once(|mut ws| async move {
            assert_eq!(read_frame(&mut ws).await, Frame::connect(PROTOCOL_VERSION.major, 7));
            write_frame(&mut ws, &Frame::connected(2, 1, 30_000)).await;

            assert_eq!(read_frame(&mut ws).await, Frame::send(7, 9, "hi"));
            write_frame(&mut ws, &Frame::deliver(9, "hello back")).await;
            ws.close(None).await.unwrap();
        })
        .await;

        let mut client = ChatClient::connect(&url, 7).await.unwrap();
        assert_eq!(client.server_id(), 2);
        assert_eq!(client.heartbeat_ms(), 30_000);

        client.send(9, "hi").await.unwrap();
        let got = client.recv().await.unwrap().unwrap();
        assert_eq!(got, ChatMessage::new(9, 7, "hello back"));
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let url = serve_once(|mut ws| async move {
            read_frame(&mut ws).await;
            write_frame(
                &mut ws,
                &Frame::error(codes::ALREADY_CONNECTED, "User 7 already connected"),
            )
            .await;
        })
        .await;

        match ChatClient::connect(&url, 7).await {
            Err(TransportError::Rejected { code, .. }) => {
                assert_eq!(code, codes::ALREADY_CONNECTED);
            }
            other => panic!("expected rejection, got {:?}", other.map(|c| c.server_id())),
        }
    }

    #[tokio::test]
    async fn test_split_halves() {
        let url = serve_once(|mut ws| async move {
            read_frame(&mut ws).await;
            write_frame(&mut ws, &Frame::connected(1, 1, 30_000)).await;
            let frame = read_frame(&mut ws).await;
            if let Frame::Send { from, text, .. } = frame {
                write_frame(&mut ws, &Frame::deliver(from, text)).await;
            }
        })
        .await;

        let client = ChatClient::connect(&url, 7).await.unwrap();
        let (mut tx, mut rx) = client.split();
        tx.send(7, "echo").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap().text(), "echo");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            ChatClient::connect(&format!("ws://{addr}"), 7).await,
            Err(TransportError::Handshake(_))
        ));
    }
}
