//! # ripple-transport
//!
//! Transport abstraction layer for the Ripple realtime client.
//!
//! The engine never touches sockets directly: it is handed a [`Transport`]
//! that can open a bidirectional frame channel, and drives the resulting
//! [`ConnSink`]/[`ConnStream`] pair. This keeps the engine protocol-agnostic
//! and lets tests inject the in-memory [`mock`] transport.
//!
//! ```rust,ignore
//! use ripple_transport::{Transport, Connected};
//!
//! async fn open(transport: &dyn Transport) -> Connected {
//!     transport.connect("wss://example.com/socket", &[]).await.unwrap()
//! }
//! ```

pub mod mock;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnSink, ConnStream, Connected, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
