//! File / blob payloads carried by the stream sub-protocol.

use bytes::Bytes;

use crate::protocol::stream::StreamMetadata;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Fully buffered file or blob. A blob is a file without a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: Option<String>,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl FilePayload {
    pub fn file(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: Some(name.into()),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn blob(mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: None,
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view, handy for text files.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn metadata(&self) -> StreamMetadata {
        StreamMetadata {
            filename: self.name.clone(),
            mime_type: Some(self.mime_type.clone()),
            size: Some(self.bytes.len() as u64),
        }
    }

    /// Rebuild from received chunks using the declared metadata.
    pub fn from_parts(meta: Option<&StreamMetadata>, bytes: Bytes) -> Self {
        Self {
            name: meta.and_then(|m| m.filename.clone()),
            mime_type: meta
                .and_then(|m| m.mime_type.clone())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            bytes,
        }
    }
}
