//! # ripple-protocol
//!
//! Wire envelope definitions for the Ripple realtime client engine.
//!
//! Every message exchanged with the backend is an [`Envelope`]: a topic, an
//! event name, an opaque payload, and two correlation identifiers (`ref` for
//! request/reply matching, `join_ref` for the channel's join generation).
//!
//! The concrete serialization is backend configuration, not a protocol
//! constant: [`EnvelopeCodec`] supports an object-keyed JSON form, a
//! positional JSON array form, and object-keyed MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec::EnvelopeCodec, Envelope, WireFormat};
//!
//! let codec = EnvelopeCodec::new(WireFormat::Json);
//! let envelope = Envelope::new("room:lobby", "shout", serde_json::json!({"body": "hi"}));
//!
//! let encoded = codec.encode(&envelope).unwrap();
//! let decoded = codec.decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{EnvelopeCodec, ProtocolError, WireFormat, WireMessage};
pub use envelope::{events, Envelope, Reply, ReplyStatus, CONTROL_TOPIC};
