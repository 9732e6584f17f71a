//! Transport errors.

use thiserror::Error;

/// Client stream errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Opening the stream or the session handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server answered with an error frame.
    #[error("Server error {code}: {message}")]
    Rejected { code: u16, message: String },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] switchboard_protocol::ProtocolError),
}
