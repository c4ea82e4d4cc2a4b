//! Error types for the Ripple engine.

use ripple_protocol::ProtocolError;
use ripple_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

use crate::auth::TokenError;
use crate::channel::ChannelState;

/// Errors surfaced to application code.
///
/// Transport-level failures are handled by the reconnection policy and only
/// reach callers as the terminal status of affected requests
/// ([`SocketError::ConnectionLost`]); protocol-level rejections go to the
/// caller that initiated the action.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Send attempted with no open transport.
    #[error("Not connected")]
    NotConnected,

    /// Server replied with an error status to a join request.
    #[error("Join rejected: {0}")]
    JoinRejected(Value),

    /// Server replied with an error status to a push.
    #[error("Push rejected: {0}")]
    PushRejected(Value),

    /// No reply within the configured window.
    #[error("Push timed out")]
    PushTimeout,

    /// Push attempted while the channel cannot carry it.
    #[error("Channel {topic} unavailable ({state})")]
    ChannelUnavailable {
        /// Channel topic.
        topic: String,
        /// State the channel was in.
        state: ChannelState,
    },

    /// Transport closed while the request was outstanding.
    #[error("Connection lost")]
    ConnectionLost,

    /// Channel was left while the request was outstanding.
    #[error("Channel left")]
    ChannelLeft,

    /// The engine task is gone.
    #[error("Socket closed")]
    SocketClosed,

    /// Token provider failed.
    #[error("Auth error: {0}")]
    Auth(#[from] TokenError),

    /// Wire codec failure.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
