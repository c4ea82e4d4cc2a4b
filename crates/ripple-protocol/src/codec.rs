//! Codec for encoding and decoding Ripple envelopes.
//!
//! The backend dictates the concrete serialization, so the codec is
//! configured with a [`WireFormat`] and must match the server byte-for-byte.
//! JSON formats travel as text frames, MessagePack as binary frames.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("MessagePack encoding error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("MessagePack decoding error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame kind does not match the configured wire format.
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Serialization shape of the envelope on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON object with named fields (default).
    #[default]
    Json,
    /// JSON positional array `[join_ref, ref, topic, event, payload]`.
    JsonArray,
    /// Object-keyed MessagePack in a binary frame.
    MsgPack,
}

/// A single transport frame, text or binary.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl WireMessage {
    /// Get the frame length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(s) => s.len(),
            WireMessage::Binary(b) => b.len(),
        }
    }

    /// Check whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Positional envelope shape used by `WireFormat::JsonArray`.
#[derive(Serialize, Deserialize)]
struct Positional(
    Option<String>,
    Option<String>,
    String,
    String,
    #[serde(default)] Value,
);

/// Envelope encoder/decoder for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec {
    format: WireFormat,
}

impl EnvelopeCodec {
    /// Create a codec for the given wire format.
    #[must_use]
    pub fn new(format: WireFormat) -> Self {
        Self { format }
    }

    /// Get the configured wire format.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode an envelope to a transport frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the frame is too large.
    pub fn encode(&self, envelope: &Envelope) -> Result<WireMessage, ProtocolError> {
        let message = match self.format {
            WireFormat::Json => WireMessage::Text(serde_json::to_string(envelope)?),
            WireFormat::JsonArray => {
                let positional = Positional(
                    envelope.join_ref.clone(),
                    envelope.reference.clone(),
                    envelope.topic.clone(),
                    envelope.event.clone(),
                    envelope.payload.clone(),
                );
                WireMessage::Text(serde_json::to_string(&positional)?)
            }
            WireFormat::MsgPack => {
                WireMessage::Binary(Bytes::from(rmp_serde::to_vec_named(envelope)?))
            }
        };

        if message.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(message.len()));
        }

        Ok(message)
    }

    /// Decode a transport frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame kind does not match the configured
    /// format, the frame is too large, or deserialization fails.
    pub fn decode(&self, message: &WireMessage) -> Result<Envelope, ProtocolError> {
        if message.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(message.len()));
        }

        match (self.format, message) {
            (WireFormat::Json, WireMessage::Text(text)) => Ok(serde_json::from_str(text)?),
            (WireFormat::JsonArray, WireMessage::Text(text)) => {
                let Positional(join_ref, reference, topic, event, payload) =
                    serde_json::from_str(text)?;
                Ok(Envelope {
                    topic,
                    event,
                    payload,
                    reference,
                    join_ref,
                })
            }
            (WireFormat::MsgPack, WireMessage::Binary(data)) => Ok(rmp_serde::from_slice(data)?),
            (WireFormat::MsgPack, WireMessage::Text(_)) => Err(ProtocolError::Malformed(
                "expected binary frame for MessagePack format".into(),
            )),
            (_, WireMessage::Binary(_)) => Err(ProtocolError::Malformed(
                "expected text frame for JSON format".into(),
            )),
        }
    }
}
