//! Protocol codecs for encoding/decoding messages
//!
//! The transport delivers whole frames, so a codec only maps one frame to one
//! [`Message`] and back. Two encodings are supported:
//! - JSON text frames
//! - CBOR binary frames

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::{Envelope, Message};

/// Errors for inbound payloads that cannot become a [`Message`]
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    Syntax(String),

    #[error("Payload is not a map")]
    NotAnObject,

    #[error("Missing or empty action field")]
    MissingAction,

    #[error("Invalid data for action '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },
}

/// Errors while encoding an outbound message
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// An encoded message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WireFrame::Text(text) => text.as_bytes(),
            WireFrame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, WireFrame::Binary(_))
    }
}

/// Converts between wire frames and messages
pub trait Codec: Send + Sync + fmt::Debug {
    /// Which encoding this codec speaks
    fn kind(&self) -> CodecKind;

    /// Decode one inbound frame
    fn decode(&self, payload: &[u8]) -> Result<Message, DecodeError>;

    /// Encode one outbound message
    fn encode(&self, message: &Message) -> CodecResult<WireFrame>;
}

/// Selectable wire encoding
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON text frames
    #[default]
    Json,
    /// CBOR binary frames
    Cbor,
}

impl CodecKind {
    /// Build the codec for this encoding
    pub fn build(self) -> Arc<dyn Codec> {
        match self {
            CodecKind::Json => Arc::new(JsonCodec),
            CodecKind::Cbor => Arc::new(CborCodec),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::Json => write!(f, "json"),
            CodecKind::Cbor => write!(f, "cbor"),
        }
    }
}

fn message_from_value(value: Value) -> Result<Message, DecodeError> {
    Message::try_from(Envelope::from_value(value)?)
}

/// JSON text codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, DecodeError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Syntax(e.to_string()))?;
        message_from_value(value)
    }

    fn encode(&self, message: &Message) -> CodecResult<WireFrame> {
        let envelope = message.to_envelope()?;
        Ok(WireFrame::Text(serde_json::to_string(&envelope)?))
    }
}

/// CBOR binary codec
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Cbor
    }

    fn decode(&self, payload: &[u8]) -> Result<Message, DecodeError> {
        let value: Value =
            ciborium::from_reader(payload).map_err(|e| DecodeError::Syntax(e.to_string()))?;
        message_from_value(value)
    }

    fn encode(&self, message: &Message) -> CodecResult<WireFrame> {
        let envelope = message.to_envelope()?;
        let mut buf = Vec::with_capacity(64);
        ciborium::into_writer(&envelope, &mut buf).map_err(|e| CodecError::Cbor(e.to_string()))?;
        Ok(WireFrame::Binary(buf))
    }
}
