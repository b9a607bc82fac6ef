//! Receiver side of a stream.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use postrpc_core::error::{ErrorCode, RequestError};
use postrpc_core::protocol::stream::decode_chunk;
use postrpc_core::protocol::{
    Envelope, FilePayload, MessageType, StreamDataBody, StreamKind, StreamMetadata, StreamStartBody,
};

use super::{OpenedStream, StreamTiming};
use crate::dispatch::MessageDispatcher;
use crate::transport::PeerId;

/// One received item.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Item of a generic stream.
    Data(Value),
    /// Decoded bytes of a file stream.
    Bytes(Bytes),
}

/// Live body received through `stream_start`.
///
/// Reads frames in arrival order. Dropping the reader before the end sends
/// `stream_cancel` to the writer.
pub struct BodyStream {
    dispatcher: MessageDispatcher,
    stream_id: String,
    request_id: String,
    start: StreamStartBody,
    peer: PeerId,
    origin: String,
    peer_instance: Option<String>,
    frames: mpsc::UnboundedReceiver<Envelope>,
    timing: StreamTiming,
    finished: bool,
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream")
            .field("stream_id", &self.stream_id)
            .field("start", &self.start)
            .field("finished", &self.finished)
            .finish()
    }
}

impl BodyStream {
    pub fn new(dispatcher: MessageDispatcher, opened: OpenedStream, timing: StreamTiming) -> Result<Self, RequestError> {
        let OpenedStream { start, frames, source, origin } = opened;
        let stream_id = start.stream_id.clone().unwrap_or_default();
        let body = match StreamStartBody::from_body(start.body.as_ref()) {
            Ok(body) => body,
            Err(e) => {
                dispatcher.unregister_stream(&stream_id);
                return Err(RequestError::new(ErrorCode::InvalidBody, e.to_string())
                    .with_request_id(start.request_id.clone()));
            }
        };
        Ok(Self {
            dispatcher,
            stream_id,
            request_id: start.request_id.clone(),
            start: body,
            peer: source,
            origin,
            peer_instance: start.creator_id.clone(),
            frames,
            timing,
            finished: false,
        })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> StreamKind {
        self.start.kind
    }

    pub fn metadata(&self) -> Option<&StreamMetadata> {
        self.start.metadata.as_ref()
    }

    pub fn auto_resolve(&self) -> bool {
        self.start.auto_resolve
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn fail(&self, code: ErrorCode, message: impl Into<String>) -> RequestError {
        RequestError::new(code, message).with_request_id(self.request_id.clone())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.dispatcher.unregister_stream(&self.stream_id);
        }
    }

    /// Next item, `None` once the writer ended the stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Chunk, RequestError>> {
        loop {
            if self.finished {
                return None;
            }
            let env = match tokio::time::timeout(self.timing.idle, self.frames.recv()).await {
                Ok(Some(env)) => env,
                Ok(None) => {
                    self.finish();
                    return Some(Err(self.fail(ErrorCode::StreamError, "stream closed")));
                }
                Err(_) => {
                    let alive = self
                        .dispatcher
                        .ping(&self.peer, &self.origin, self.peer_instance.clone(), self.timing.ping_timeout)
                        .await;
                    if alive {
                        continue;
                    }
                    tracing::debug!(stream_id = %self.stream_id, "stream writer unreachable");
                    self.finish();
                    return Some(Err(self.fail(ErrorCode::StreamError, "stream writer unreachable")));
                }
            };

            match env.kind {
                MessageType::StreamData => return Some(self.data_frame(&env)),
                MessageType::StreamEnd => {
                    self.finish();
                    return None;
                }
                MessageType::StreamError => {
                    self.finish();
                    let message = env
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "stream failed".to_string());
                    return Some(Err(self.fail(ErrorCode::StreamError, message)));
                }
                MessageType::StreamCancel => {
                    self.finish();
                    return Some(Err(self.fail(ErrorCode::StreamCancelled, "stream cancelled by writer")));
                }
                _ => continue,
            }
        }
    }

    fn data_frame(&mut self, env: &Envelope) -> Result<Chunk, RequestError> {
        let body = match StreamDataBody::from_body(env.body.as_ref()) {
            Ok(body) => body,
            Err(e) => {
                self.cancel_inner();
                return Err(self.fail(ErrorCode::InvalidBody, e.to_string()));
            }
        };
        if body.done {
            self.finish();
        }
        match self.start.kind {
            StreamKind::Generic => Ok(Chunk::Data(body.data)),
            StreamKind::File => match decode_chunk(&body.data) {
                Ok(bytes) => Ok(Chunk::Bytes(bytes)),
                Err(e) => {
                    self.cancel_inner();
                    Err(self.fail(ErrorCode::InvalidBody, e.to_string()))
                }
            },
        }
    }

    /// Drain every remaining chunk into one buffered file.
    pub async fn into_file(mut self) -> Result<FilePayload, RequestError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            match chunk? {
                Chunk::Bytes(b) => buf.extend_from_slice(&b),
                Chunk::Data(Value::String(s)) => buf.extend_from_slice(s.as_bytes()),
                Chunk::Data(other) => buf.extend_from_slice(other.to_string().as_bytes()),
            }
        }
        Ok(FilePayload::from_parts(self.start.metadata.as_ref(), buf.freeze()))
    }

    /// Drain a generic stream into its items.
    pub async fn collect_items(mut self) -> Result<Vec<Value>, RequestError> {
        let mut items = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            match chunk? {
                Chunk::Data(v) => items.push(v),
                Chunk::Bytes(b) => items.push(Value::String(String::from_utf8_lossy(&b).into_owned())),
            }
        }
        Ok(items)
    }

    pub fn into_stream(self) -> BoxStream<'static, Result<Chunk, RequestError>> {
        stream::unfold(self, |mut s| async move { s.next_chunk().await.map(|c| (c, s)) }).boxed()
    }

    /// Stop reading and tell the writer.
    pub fn cancel(mut self) {
        self.cancel_inner();
    }

    fn cancel_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finish();
        let mut env = Envelope::new(MessageType::StreamCancel, self.request_id.clone())
            .with_stream_id(self.stream_id.clone());
        env.target_id = self.peer_instance.clone();
        if let Err(e) = self.dispatcher.send(&self.peer, env, &self.origin) {
            tracing::debug!(error = %e, stream_id = %self.stream_id, "stream_cancel not delivered");
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        self.cancel_inner();
    }
}
