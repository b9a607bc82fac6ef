//! Response object bound to one request.
//!
//! Every sending method goes through one guard: the first call wins and
//! later calls return `false` without emitting anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use postrpc_core::error::ErrorCode;
use postrpc_core::ids;
use postrpc_core::protocol::envelope::status_text;
use postrpc_core::protocol::{Envelope, FilePayload, Headers, MessageType, StreamKind};

use crate::client::cookie::SET_COOKIE;
use crate::dispatch::MessageDispatcher;
use crate::stream::writer::StreamRoute;
use crate::stream::{StreamOptions, StreamSource, StreamWriter};
use crate::transport::PeerId;

/// Attributes for [`ServerResponse::cookie`].
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub path: Option<String>,
    pub max_age: Option<i64>,
    pub http_only: bool,
}

#[derive(Clone)]
pub struct ServerResponse {
    inner: Arc<ResponseState>,
}

struct ResponseState {
    dispatcher: MessageDispatcher,
    peer: PeerId,
    origin: String,
    request_id: String,
    path: String,
    client_id: Option<String>,
    chunk_size: usize,
    sent: AtomicBool,
    status: Mutex<Option<u16>>,
    headers: Mutex<Headers>,
}

impl std::fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerResponse")
            .field("request_id", &self.inner.request_id)
            .field("sent", &self.is_sent())
            .finish()
    }
}

impl ServerResponse {
    pub(crate) fn new(
        dispatcher: MessageDispatcher,
        peer: PeerId,
        origin: String,
        req: &Envelope,
        chunk_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ResponseState {
                dispatcher,
                peer,
                origin,
                request_id: req.request_id.clone(),
                path: req.path.clone().unwrap_or_default(),
                client_id: req.creator_id.clone(),
                chunk_size,
                sent: AtomicBool::new(false),
                status: Mutex::new(None),
                headers: Mutex::new(Headers::new()),
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn status(&self, code: u16) -> &Self {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
        self
    }

    pub fn status_code(&self) -> u16 {
        self.explicit_status().unwrap_or(200)
    }

    pub(crate) fn explicit_status(&self) -> Option<u16> {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_header(&self, name: &str, value: impl Into<String>) -> &Self {
        self.inner
            .headers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn headers(&self) -> Headers {
        self.inner.headers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cookie(&self, name: &str, value: &str, opts: &CookieOptions) -> &Self {
        let mut line = format!("{name}={value}; Path={}", opts.path.as_deref().unwrap_or("/"));
        if let Some(age) = opts.max_age {
            line.push_str(&format!("; Max-Age={age}"));
        }
        if opts.http_only {
            line.push_str("; HttpOnly");
        }
        let mut headers = self.inner.headers.lock().unwrap_or_else(|e| e.into_inner());
        let merged = match headers.get(SET_COOKIE) {
            Some(prev) => format!("{prev}\n{line}"),
            None => line,
        };
        headers.insert(SET_COOKIE.to_string(), merged);
        drop(headers);
        self
    }

    pub fn clear_cookie(&self, name: &str, path: Option<&str>) -> &Self {
        self.cookie(
            name,
            "",
            &CookieOptions {
                path: path.map(str::to_string),
                max_age: Some(0),
                http_only: false,
            },
        )
    }

    pub fn is_sent(&self) -> bool {
        self.inner.sent.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        !self.inner.sent.swap(true, Ordering::AcqRel)
    }

    fn envelope(&self, kind: MessageType) -> Envelope {
        let mut env = Envelope::new(kind, self.inner.request_id.clone()).with_path(self.inner.path.clone());
        env.target_id = self.inner.client_id.clone();
        env
    }

    fn post(&self, env: Envelope) {
        if let Err(e) = self.inner.dispatcher.send(&self.inner.peer, env, &self.inner.origin) {
            tracing::debug!(error = %e, request_id = %self.inner.request_id, "response not delivered");
        }
    }

    pub fn send(&self, data: Value) -> bool {
        if !self.claim() {
            return false;
        }
        let status = self.status_code();
        let mut env = self.envelope(MessageType::Response);
        env.data = Some(data);
        env.status = Some(status);
        env.status_text = Some(status_text(status).to_string());
        let headers = self.headers();
        if !headers.is_empty() {
            env.headers = Some(headers);
        }
        self.post(env);
        true
    }

    pub fn json<T: Serialize>(&self, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(v) => self.send(v),
            Err(e) => self.send_error(ErrorCode::RequestError, &format!("response encode failed: {e}"), Some(500)),
        }
    }

    /// Stream a file; the client resolves it to a buffered file.
    pub fn send_file(&self, file: FilePayload) -> bool {
        let opts = StreamOptions {
            kind: Some(StreamKind::File),
            auto_resolve: true,
            ..Default::default()
        };
        self.send_stream(StreamSource::File(file), opts)
    }

    pub fn send_stream(&self, source: StreamSource, mut opts: StreamOptions) -> bool {
        if !self.claim() {
            return false;
        }
        if opts.chunk_size == StreamOptions::default().chunk_size {
            opts.chunk_size = self.inner.chunk_size;
        }
        let mut writer = StreamWriter::new(
            self.inner.dispatcher.clone(),
            StreamRoute {
                target: self.inner.peer.clone(),
                origin: self.inner.origin.clone(),
                target_id: self.inner.client_id.clone(),
                request_id: self.inner.request_id.clone(),
            },
            ids::stream_id(),
            source,
            opts,
        )
        .with_response_meta(self.status_code(), self.headers());

        if let Err(e) = writer.open() {
            tracing::debug!(code = %e.code, request_id = %self.inner.request_id, "stream_start not delivered");
            return true;
        }
        tokio::spawn(async move {
            if let Err(e) = writer.pump().await {
                tracing::debug!(code = %e.code, error = %e.message, "response stream aborted");
            }
        });
        true
    }

    pub fn send_error(&self, code: ErrorCode, message: &str, status: Option<u16>) -> bool {
        if !self.claim() {
            return false;
        }
        let status = status.unwrap_or_else(|| code.default_status());
        let mut env = Envelope::error(self.inner.request_id.clone(), &code, message, status);
        env.path = Some(self.inner.path.clone());
        env.target_id = self.inner.client_id.clone();
        let headers = self.headers();
        if !headers.is_empty() {
            env.headers = Some(headers);
        }
        self.post(env);
        true
    }

    /// Tell the client the result will come later. No-op once sent.
    pub(crate) fn notify_async(&self) {
        if !self.is_sent() {
            self.post(self.envelope(MessageType::Async));
        }
    }
}
