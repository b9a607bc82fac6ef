//! Stream sub-protocol frame bodies.
//!
//! `stream_start` carries a [`StreamStartBody`] in `body`, each `stream_data`
//! carries a [`StreamDataBody`]. Binary chunks travel as base64 strings so
//! that frames stay plain JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// What the stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Arbitrary JSON items.
    #[default]
    Generic,
    /// Base64 byte chunks of one file or blob.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStartBody {
    #[serde(rename = "type", default)]
    pub kind: StreamKind,
    #[serde(default = "default_true")]
    pub chunked: bool,
    #[serde(default)]
    pub auto_resolve: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<StreamMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDataBody {
    pub data: Value,
    #[serde(default)]
    pub done: bool,
}

fn default_true() -> bool {
    true
}

impl StreamStartBody {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_body(body: Option<&Value>) -> Result<Self> {
        let body = body.ok_or_else(|| RpcError::BadRequest("stream_start without body".into()))?;
        serde_json::from_value(body.clone())
            .map_err(|e| RpcError::BadRequest(format!("invalid stream_start body: {e}")))
    }
}

impl StreamDataBody {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_body(body: Option<&Value>) -> Result<Self> {
        let body = body.ok_or_else(|| RpcError::BadRequest("stream_data without body".into()))?;
        serde_json::from_value(body.clone())
            .map_err(|e| RpcError::BadRequest(format!("invalid stream_data body: {e}")))
    }
}

/// Encode a byte chunk for a `stream_data` frame.
pub fn encode_chunk(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

/// Decode a byte chunk from a `stream_data` frame.
pub fn decode_chunk(data: &Value) -> Result<Bytes> {
    let s = data
        .as_str()
        .ok_or_else(|| RpcError::BadRequest("file chunk must be a base64 string".into()))?;
    STANDARD
        .decode(s)
        .map(Bytes::from)
        .map_err(|e| RpcError::BadRequest(format!("invalid base64 chunk: {e}")))
}
