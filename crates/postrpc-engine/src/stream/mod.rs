//! Chunked streaming sub-protocol.
//!
//! `stream_start` -> `stream_data`* (last one `done: true`) -> `stream_end`,
//! or `stream_error` / `stream_cancel` to abort. Frames are routed by
//! `streamId` through the dispatcher's stream table; ordering is the
//! transport's FIFO order, there is no reassembly.

pub mod inbox;
pub mod reader;
pub mod writer;

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use postrpc_core::protocol::Envelope;

use crate::transport::PeerId;

pub use inbox::StreamInbox;
pub use reader::{BodyStream, Chunk};
pub use writer::{StreamOptions, StreamSource, StreamWriter};

/// A `stream_start` that has been bound to the dispatcher, with the frames
/// queued since.
pub struct OpenedStream {
    pub start: Envelope,
    pub frames: mpsc::UnboundedReceiver<Envelope>,
    pub source: PeerId,
    pub origin: String,
}

/// Liveness settings for readers.
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Silence after which the reader pings the writer.
    pub idle: Duration,
    /// How long a ping may take before the peer counts as gone.
    pub ping_timeout: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(1),
        }
    }
}

pub(crate) fn chunk_text(text: &str, size: usize) -> Vec<Value> {
    let size = size.max(4);
    let mut out = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut cut = size.min(rest.len());
        while !rest.is_char_boundary(cut) {
            cut += 1;
        }
        let (head, tail) = rest.split_at(cut);
        out.push(Value::String(head.to_string()));
        rest = tail;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::chunk_text;

    #[test]
    fn text_chunks_respect_char_boundaries() {
        let chunks = chunk_text("héllo wörld", 4);
        let joined: String = chunks.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(joined, "héllo wörld");
        assert!(chunks.len() >= 3);
        assert!(chunk_text("", 4).is_empty());
    }
}
