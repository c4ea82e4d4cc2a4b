//! Envelope types for the Ripple protocol.
//!
//! An envelope carries one logical message for one topic. The `ref` field
//! correlates a request with its asynchronous reply; `join_ref` tags the
//! channel join generation the message belongs to, so replies addressed to
//! a superseded generation can be recognized and discarded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic reserved for connection-level control traffic (heartbeats).
pub const CONTROL_TOPIC: &str = "ripple";

/// Well-known event names.
///
/// The backend must be configured with the same set; see `DESIGN.md` for the
/// protocol naming decision.
pub mod events {
    /// Server reply to a ref-carrying request.
    pub const REPLY: &str = "reply";
    /// Channel join request.
    pub const JOIN: &str = "join";
    /// Channel leave request.
    pub const LEAVE: &str = "leave";
    /// Server-initiated channel shutdown.
    pub const CLOSE: &str = "close";
    /// Server-side channel failure.
    pub const ERROR: &str = "error";
    /// Connection keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Full presence snapshot for a topic.
    pub const PRESENCE_STATE: &str = "presence_state";
    /// Incremental presence update for a topic.
    pub const PRESENCE_DIFF: &str = "presence_diff";
    /// Register own presence metadata.
    pub const PRESENCE_TRACK: &str = "presence_track";
    /// Remove own presence metadata.
    pub const PRESENCE_UNTRACK: &str = "presence_untrack";
}

/// A protocol envelope.
///
/// `reference` and `join_ref` are opaque strings assigned by the client
/// engine; both are `None` until assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical channel name the message is scoped to.
    pub topic: String,
    /// Event name, matched exactly by subscribers.
    pub event: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub payload: Value,
    /// Request correlation identifier, unique per connection.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Join generation the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Envelope {
    /// Create a new envelope with no correlation identifiers.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
            join_ref: None,
        }
    }

    /// Create a join request for a topic.
    #[must_use]
    pub fn join(topic: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, events::JOIN, payload)
    }

    /// Create a leave request for a topic.
    #[must_use]
    pub fn leave(topic: impl Into<String>) -> Self {
        Self::new(topic, events::LEAVE, Value::Null)
    }

    /// Create a connection heartbeat.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(CONTROL_TOPIC, events::HEARTBEAT, Value::Null)
    }

    /// Set the request reference.
    #[must_use]
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set the join generation.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Check whether this envelope is a reply to an earlier request.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.event == events::REPLY
    }
}

/// Status of a server reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Request accepted.
    Ok,
    /// Request rejected.
    Error,
}

/// Parsed payload of a reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Outcome of the correlated request.
    pub status: ReplyStatus,
    /// Server-provided response value.
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Create an `ok` reply.
    #[must_use]
    pub fn ok(response: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            response,
        }
    }

    /// Create an `error` reply.
    #[must_use]
    pub fn error(response: Value) -> Self {
        Self {
            status: ReplyStatus::Error,
            response,
        }
    }

    /// Parse a reply from an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the reply shape.
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }

    /// Check whether the reply carries an `ok` status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}
