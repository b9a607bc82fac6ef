//! Envelope (JSON) and its admission gate.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, Result, RpcError};

/// Key carrying the protocol version; its presence marks a postrpc envelope.
pub const VERSION_KEY: &str = "__postrpc__";

/// Version stamped on every outgoing envelope.
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest version a receiver will process.
pub const MIN_SUPPORTED_VERSION: u32 = 2;

/// Header map. Keys are lower-cased when merged.
pub type Headers = BTreeMap<String, String>;

/// Cookie name -> value pairs sent with a request.
pub type Cookies = BTreeMap<String, String>;

/// Envelope `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Ack,
    Async,
    Response,
    Error,
    Ping,
    Pong,
    StreamStart,
    StreamData,
    StreamEnd,
    StreamError,
    StreamCancel,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Ack => "ack",
            MessageType::Async => "async",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::StreamStart => "stream_start",
            MessageType::StreamData => "stream_data",
            MessageType::StreamEnd => "stream_end",
            MessageType::StreamError => "stream_error",
            MessageType::StreamCancel => "stream_cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "request" => MessageType::Request,
            "ack" => MessageType::Ack,
            "async" => MessageType::Async,
            "response" => MessageType::Response,
            "error" => MessageType::Error,
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "stream_start" => MessageType::StreamStart,
            "stream_data" => MessageType::StreamData,
            "stream_end" => MessageType::StreamEnd,
            "stream_error" => MessageType::StreamError,
            "stream_cancel" => MessageType::StreamCancel,
            _ => return None,
        })
    }

    /// Frames routed by `streamId` rather than by type handler.
    pub fn is_stream_frame(self) -> bool {
        matches!(
            self,
            MessageType::StreamData
                | MessageType::StreamEnd
                | MessageType::StreamError
                | MessageType::StreamCancel
        )
    }
}

/// Which side of the exchange emitted the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// `error` field of ERROR / STREAM_ERROR envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
}

impl ErrorBody {
    pub fn new(code: &ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.as_str().to_string(),
        }
    }
}

/// The only wire unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "__postrpc__")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub request_id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<Cookies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_ack: Option<bool>,
    /// Token the ACK must echo for the client to accept it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl Envelope {
    /// Fresh envelope stamped with the current version and time.
    pub fn new(kind: MessageType, request_id: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind,
            request_id: request_id.into(),
            timestamp: now_millis(),
            tenant_key: None,
            path: None,
            body: None,
            data: None,
            headers: None,
            cookies: None,
            error: None,
            status: None,
            status_text: None,
            require_ack: None,
            ack_token: None,
            role: None,
            creator_id: None,
            target_id: None,
            stream_id: None,
        }
    }

    /// ERROR envelope answering `request_id`.
    pub fn error(request_id: impl Into<String>, code: &ErrorCode, message: impl Into<String>, status: u16) -> Self {
        let mut env = Envelope::new(MessageType::Error, request_id);
        env.error = Some(ErrorBody::new(code, message));
        env.status = Some(status);
        env.status_text = Some(status_text(status).to_string());
        env
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Whether the sender expects a delivery ACK (requests default to yes).
    pub fn wants_ack(&self) -> bool {
        self.kind == MessageType::Request && self.require_ack.unwrap_or(true)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self)
            .map_err(|e| RpcError::Internal(format!("envelope encode failed: {e}")))
    }

    /// Decode after the admission gate.
    pub fn from_value(v: Value) -> Result<Self> {
        if !is_valid_envelope(&v) {
            return Err(RpcError::BadRequest("not a postrpc envelope".into()));
        }
        serde_json::from_value(v)
            .map_err(|e| RpcError::BadRequest(format!("invalid envelope: {e}")))
    }
}

/// True iff `v` is an object carrying the version tag and a known `type`.
pub fn is_valid_envelope(v: &Value) -> bool {
    let Some(obj) = v.as_object() else {
        return false;
    };
    if !obj.get(VERSION_KEY).map(Value::is_u64).unwrap_or(false) {
        return false;
    }
    obj.get("type")
        .and_then(Value::as_str)
        .and_then(MessageType::parse)
        .is_some()
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "",
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
