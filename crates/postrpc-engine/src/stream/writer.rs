//! Sender side: turn a source into `stream_*` frames.

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use postrpc_core::error::{ErrorCode, RequestError};
use postrpc_core::protocol::stream::encode_chunk;
use postrpc_core::protocol::{
    ErrorBody, Envelope, FilePayload, Headers, MessageType, StreamDataBody, StreamKind, StreamMetadata,
    StreamStartBody,
};

use super::chunk_text;
use crate::dispatch::MessageDispatcher;
use crate::transport::PeerId;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Body representations that travel as a stream.
pub enum StreamSource {
    Text(String),
    Bytes(Bytes),
    File(FilePayload),
    Items(BoxStream<'static, Result<Value, RequestError>>),
}

impl StreamSource {
    pub fn items<S>(s: S) -> Self
    where
        S: futures_util::Stream<Item = Result<Value, RequestError>> + Send + 'static,
    {
        StreamSource::Items(s.boxed())
    }

    fn default_kind(&self) -> StreamKind {
        match self {
            StreamSource::Bytes(_) | StreamSource::File(_) => StreamKind::File,
            StreamSource::Text(_) | StreamSource::Items(_) => StreamKind::Generic,
        }
    }

    fn default_metadata(&self) -> Option<StreamMetadata> {
        match self {
            StreamSource::File(f) => Some(f.metadata()),
            StreamSource::Bytes(b) => Some(StreamMetadata {
                size: Some(b.len() as u64),
                ..Default::default()
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSource::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            StreamSource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            StreamSource::File(p) => f.debug_tuple("File").field(&p.name).finish(),
            StreamSource::Items(_) => f.write_str("Items(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Overrides the kind implied by the source.
    pub kind: Option<StreamKind>,
    pub chunked: bool,
    pub auto_resolve: bool,
    /// Overrides the metadata implied by the source.
    pub metadata: Option<StreamMetadata>,
    pub chunk_size: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            kind: None,
            chunked: true,
            auto_resolve: false,
            metadata: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Where the frames go and which request they belong to.
#[derive(Debug, Clone)]
pub struct StreamRoute {
    pub target: PeerId,
    pub origin: String,
    /// Instance the frames are addressed to, if known.
    pub target_id: Option<String>,
    pub request_id: String,
}

pub struct StreamWriter {
    dispatcher: MessageDispatcher,
    route: StreamRoute,
    stream_id: String,
    start: StreamStartBody,
    source: StreamSource,
    chunk_size: usize,
    cancel: Option<mpsc::UnboundedReceiver<Envelope>>,
    status: Option<u16>,
    headers: Option<Headers>,
}

impl StreamWriter {
    pub fn new(
        dispatcher: MessageDispatcher,
        route: StreamRoute,
        stream_id: impl Into<String>,
        source: StreamSource,
        opts: StreamOptions,
    ) -> Self {
        let start = StreamStartBody {
            kind: opts.kind.unwrap_or_else(|| source.default_kind()),
            chunked: opts.chunked,
            auto_resolve: opts.auto_resolve,
            metadata: opts.metadata.or_else(|| source.default_metadata()),
        };
        Self {
            dispatcher,
            route,
            stream_id: stream_id.into(),
            start,
            source,
            chunk_size: opts.chunk_size.max(1),
            cancel: None,
            status: None,
            headers: None,
        }
    }

    /// Status and headers carried on `stream_start` when the stream is a response.
    pub fn with_response_meta(mut self, status: u16, headers: Headers) -> Self {
        self.status = Some(status);
        self.headers = (!headers.is_empty()).then_some(headers);
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn start_body(&self) -> &StreamStartBody {
        &self.start
    }

    fn frame(&self, kind: MessageType) -> Envelope {
        let mut env = Envelope::new(kind, self.route.request_id.clone()).with_stream_id(self.stream_id.clone());
        env.target_id = self.route.target_id.clone();
        env
    }

    fn post(&self, env: Envelope) -> Result<(), RequestError> {
        self.dispatcher
            .send(&self.route.target, env, &self.route.origin)
            .map_err(|e| RequestError::from(e).with_request_id(self.route.request_id.clone()))
    }

    /// Emit `stream_start` and start listening for a cancel from the reader.
    pub fn open(&mut self) -> Result<(), RequestError> {
        self.cancel = Some(self.dispatcher.register_stream(&self.stream_id));
        let mut env = self.frame(MessageType::StreamStart).with_body(self.start.to_value());
        env.status = self.status;
        env.headers = self.headers.clone();
        let res = self.post(env);
        if res.is_err() {
            self.dispatcher.unregister_stream(&self.stream_id);
        }
        res
    }

    fn cancelled(&mut self) -> bool {
        match self.cancel.as_mut().map(|rx| rx.try_recv()) {
            Some(Ok(env)) => env.kind == MessageType::StreamCancel,
            _ => false,
        }
    }

    fn data(&self, data: Value, done: bool) -> Result<(), RequestError> {
        let env = self
            .frame(MessageType::StreamData)
            .with_body(StreamDataBody { data, done }.to_value());
        self.post(env)
    }

    async fn send_all(&mut self, chunks: Vec<Value>) -> Result<(), RequestError> {
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            if self.cancelled() {
                return Err(self.cancel_error());
            }
            self.data(chunk, i == last)?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn cancel_error(&self) -> RequestError {
        RequestError::new(ErrorCode::StreamCancelled, "stream cancelled by reader")
            .with_request_id(self.route.request_id.clone())
    }

    fn byte_chunks(&self, bytes: &[u8]) -> Vec<Value> {
        if !self.start.chunked {
            return vec![encode_chunk(bytes)];
        }
        bytes.chunks(self.chunk_size).map(encode_chunk).collect()
    }

    /// Send every data frame then `stream_end`. `open` must have succeeded.
    pub async fn pump(mut self) -> Result<(), RequestError> {
        let source = std::mem::replace(&mut self.source, StreamSource::Text(String::new()));
        let res = match source {
            StreamSource::Text(text) => {
                let chunks = match (self.start.kind, self.start.chunked) {
                    (StreamKind::File, _) => self.byte_chunks(text.as_bytes()),
                    (StreamKind::Generic, true) => chunk_text(&text, self.chunk_size),
                    (StreamKind::Generic, false) => vec![Value::String(text)],
                };
                self.send_all(chunks).await
            }
            StreamSource::Bytes(bytes) => {
                let chunks = self.byte_chunks(&bytes);
                self.send_all(chunks).await
            }
            StreamSource::File(file) => {
                let chunks = self.byte_chunks(&file.bytes);
                self.send_all(chunks).await
            }
            StreamSource::Items(items) => self.pump_items(items).await,
        };

        match &res {
            Ok(()) => {
                self.post(self.frame(MessageType::StreamEnd))?;
            }
            Err(e) if e.code == ErrorCode::StreamCancelled => {}
            Err(e) => {
                let mut env = self.frame(MessageType::StreamError);
                env.error = Some(ErrorBody::new(&ErrorCode::StreamError, e.message.clone()));
                let _ = self.post(env);
            }
        }
        self.dispatcher.unregister_stream(&self.stream_id);
        res
    }

    async fn pump_items(&mut self, mut items: BoxStream<'static, Result<Value, RequestError>>) -> Result<(), RequestError> {
        if !self.start.chunked {
            let mut all = Vec::new();
            while let Some(item) = items.next().await {
                all.push(item?);
            }
            return self.send_all(vec![Value::Array(all)]).await;
        }

        let mut next = items.next().await;
        while let Some(item) = next {
            let item = item?;
            let following = items.next().await;
            if self.cancelled() {
                return Err(self.cancel_error());
            }
            self.data(item, following.is_none())?;
            tokio::task::yield_now().await;
            next = following;
        }
        Ok(())
    }

    /// Abort from the writer side.
    pub fn fail(&self, message: &str) {
        let mut env = self.frame(MessageType::StreamError);
        env.error = Some(ErrorBody::new(&ErrorCode::StreamError, message));
        let _ = self.post(env);
        self.dispatcher.unregister_stream(&self.stream_id);
    }
}
