//! Transport abstraction traits for the Ripple client.
//!
//! A [`Transport`] opens one connection at a time and hands back the two
//! halves of it: a [`ConnSink`] the engine writes frames to, and a
//! [`ConnStream`] a reader task drains. The split mirrors how the engine
//! uses them — writes happen inside its serialization domain, reads in a
//! dedicated forwarding task.

use async_trait::async_trait;
use ripple_protocol::WireMessage;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send a frame.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An established connection, split into its two directions.
pub struct Connected {
    /// Outbound half, owned by the engine.
    pub sink: Box<dyn ConnSink>,
    /// Inbound half, drained by a reader task.
    pub stream: Box<dyn ConnStream>,
}

/// A transport that can open client connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<Connected, TransportError>;

    /// Get the transport name (e.g., "websocket", "mock").
    fn name(&self) -> &'static str;
}

/// Outbound half of a connection.
#[async_trait]
pub trait ConnSink: Send {
    /// Send a frame.
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait ConnStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` when the connection is closed cleanly.
    async fn next(&mut self) -> Result<Option<WireMessage>, TransportError>;
}
