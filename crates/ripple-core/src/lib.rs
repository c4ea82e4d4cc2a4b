//! # ripple-core
//!
//! Client-side engine for the Ripple realtime protocol: many logical topics
//! multiplexed over one persistent connection, with request/reply
//! correlation, presence tracking, and transparent reconnection.
//!
//! - **Socket** - connection lifecycle, heartbeat, reconnect backoff, and
//!   the registry of channels
//! - **Channel** - per-topic state machine (join/leave/push/rejoin)
//! - **Push** - one in-flight request, resolved exactly once
//! - **Presence** - shared membership map fed by server diffs
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐     ┌──────────┐     ┌──────────┐
//! │  Socket  │────▶│ Channel  │────▶│   Push   │
//! └──────────┘     └──────────┘     └──────────┘
//!       │                │
//!       ▼                ▼
//! ┌──────────┐     ┌──────────┐
//! │Transport │     │ Presence │
//! └──────────┘     └──────────┘
//! ```
//!
//! All socket and channel state is mutated inside one task per socket,
//! driven by a command channel; application handles and background timers
//! only ever message into it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ripple_core::{ChannelConfig, Socket, SocketConfig, StaticToken};
//! use ripple_transport::WebSocketTransport;
//!
//! # async fn run() -> Result<(), ripple_core::SocketError> {
//! let socket = Socket::new(
//!     "wss://example.com/socket",
//!     SocketConfig::default(),
//!     Arc::new(WebSocketTransport::new()),
//!     Arc::new(StaticToken::new("bearer-token")),
//! );
//! socket.connect().await?;
//!
//! let room = socket.channel("room:lobby", ChannelConfig::default()).await?;
//! room.join().await?;
//! room.push("shout", serde_json::json!({"body": "hello"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod presence;
pub mod push;
pub mod socket;

pub use auth::{StaticToken, TokenError, TokenProvider};
pub use channel::{
    Channel, ChannelState, EventSubscription, PresenceSubscription, PresenceUpdate,
};
pub use config::{Backoff, ChannelConfig, SocketConfig};
pub use error::SocketError;
pub use presence::{merge, Presence, PresenceDiff, PresenceMeta, PresenceState};
pub use push::{Push, PushStatus};
pub use socket::{Socket, SocketStatus};
