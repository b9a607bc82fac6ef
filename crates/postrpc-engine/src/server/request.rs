//! Incoming request as seen by middlewares and handlers.

use serde_json::Value;

use postrpc_core::protocol::{Cookies, FilePayload, Headers};

use super::router::Params;
use crate::stream::BodyStream;
use crate::transport::PeerId;

/// Request handed to middlewares and the route handler.
#[derive(Debug)]
pub struct ServerRequest {
    pub request_id: String,
    pub path: String,
    pub params: Params,
    /// Inline body; `Null` for streamed bodies.
    pub body: Value,
    /// Buffered file body (`send_file` on the client).
    pub file: Option<FilePayload>,
    /// Live body (`send_stream` on the client).
    pub stream: Option<BodyStream>,
    pub headers: Headers,
    pub cookies: Cookies,
    pub origin: String,
    pub source: PeerId,
    /// Client instance that sent the request.
    pub creator_id: Option<String>,
}

impl ServerRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Take the live body stream, if any.
    pub fn take_stream(&mut self) -> Option<BodyStream> {
        self.stream.take()
    }
}
