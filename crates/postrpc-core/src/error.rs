//! Shared error types across postrpc crates.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Stable error codes carried in `error.code` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Target window exists but nothing is listening yet.
    IframeNotReady,
    /// Target window is gone.
    TargetWindowClosed,
    /// No ACK within the ack timeout.
    AckTimeout,
    /// No result within the request timeout.
    Timeout,
    /// No result within the async timeout after an ASYNC notification.
    AsyncTimeout,
    /// Body stream handshake never started.
    StreamStartTimeout,
    /// No route matched the request path.
    MethodNotFound,
    /// Per-peer concurrency ceiling reached.
    TooManyRequests,
    /// Envelope version below the supported minimum.
    ProtocolUnsupported,
    /// Handler finished without producing a response.
    NoResponse,
    /// Handler or middleware failed.
    RequestError,
    /// Stream transfer failed.
    StreamError,
    /// Stream cancelled by either side.
    StreamCancelled,
    /// Engine destroyed while the request was in flight.
    ClientDestroyed,
    /// Stream or file body could not be decoded.
    InvalidBody,
    /// Application-defined code sent by a handler.
    Custom(String),
}

impl ErrorCode {
    /// String representation used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::IframeNotReady => "IFRAME_NOT_READY",
            ErrorCode::TargetWindowClosed => "TARGET_WINDOW_CLOSED",
            ErrorCode::AckTimeout => "ACK_TIMEOUT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::AsyncTimeout => "ASYNC_TIMEOUT",
            ErrorCode::StreamStartTimeout => "STREAM_START_TIMEOUT",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::ProtocolUnsupported => "PROTOCOL_UNSUPPORTED",
            ErrorCode::NoResponse => "NO_RESPONSE",
            ErrorCode::RequestError => "REQUEST_ERROR",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::StreamCancelled => "STREAM_CANCELLED",
            ErrorCode::ClientDestroyed => "CLIENT_DESTROYED",
            ErrorCode::InvalidBody => "INVALID_BODY",
            ErrorCode::Custom(code) => code.as_str(),
        }
    }

    /// Parse a wire code. Unknown codes are kept verbatim.
    pub fn from_wire(code: &str) -> Self {
        match code {
            "IFRAME_NOT_READY" => ErrorCode::IframeNotReady,
            "TARGET_WINDOW_CLOSED" => ErrorCode::TargetWindowClosed,
            "ACK_TIMEOUT" => ErrorCode::AckTimeout,
            "TIMEOUT" => ErrorCode::Timeout,
            "ASYNC_TIMEOUT" => ErrorCode::AsyncTimeout,
            "STREAM_START_TIMEOUT" => ErrorCode::StreamStartTimeout,
            "METHOD_NOT_FOUND" => ErrorCode::MethodNotFound,
            "TOO_MANY_REQUESTS" => ErrorCode::TooManyRequests,
            "PROTOCOL_UNSUPPORTED" => ErrorCode::ProtocolUnsupported,
            "NO_RESPONSE" => ErrorCode::NoResponse,
            "REQUEST_ERROR" => ErrorCode::RequestError,
            "STREAM_ERROR" => ErrorCode::StreamError,
            "STREAM_CANCELLED" => ErrorCode::StreamCancelled,
            "CLIENT_DESTROYED" => ErrorCode::ClientDestroyed,
            "INVALID_BODY" => ErrorCode::InvalidBody,
            other => ErrorCode::Custom(other.to_string()),
        }
    }

    /// HTTP-like status the server attaches when it reports this code.
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorCode::MethodNotFound => 404,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::ProtocolUnsupported => 400,
            ErrorCode::InvalidBody => 400,
            ErrorCode::StreamStartTimeout => 408,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Engine-level error: config, transport, decoding.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("target window not ready")]
    NotReady,
    #[error("target window closed")]
    TargetClosed,
    #[error("instance destroyed")]
    Destroyed,
    #[error("internal: {0}")]
    Internal(String),
}

impl RpcError {
    /// Map to a stable wire code.
    pub fn code(&self) -> ErrorCode {
        match self {
            RpcError::BadRequest(_) | RpcError::InvalidConfig(_) => ErrorCode::InvalidBody,
            RpcError::UnsupportedVersion(_) => ErrorCode::ProtocolUnsupported,
            RpcError::NotReady => ErrorCode::IframeNotReady,
            RpcError::TargetClosed => ErrorCode::TargetWindowClosed,
            RpcError::Destroyed => ErrorCode::ClientDestroyed,
            RpcError::Internal(_) => ErrorCode::RequestError,
        }
    }
}

/// Response metadata attached to a failed request when the peer answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub status: u16,
    pub status_text: Option<String>,
    pub data: Option<Value>,
}

/// Structured failure of a `send`-family call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
    pub response: Option<ErrorResponse>,
}

impl RequestError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
            response: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_response(mut self, response: ErrorResponse) -> Self {
        self.response = Some(response);
        self
    }

    /// Status reported by the peer, if any.
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }
}

impl From<RpcError> for RequestError {
    fn from(e: RpcError) -> Self {
        RequestError::new(e.code(), e.to_string())
    }
}
