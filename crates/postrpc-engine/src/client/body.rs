//! Request and response bodies as explicit variants.

use serde_json::Value;

use postrpc_core::protocol::{FilePayload, Headers};

use crate::stream::{BodyStream, StreamSource};

/// Request body, resolved once at the call boundary.
#[derive(Debug)]
pub enum RequestBody {
    /// Inline JSON (`Null` when there is no body).
    Plain(Value),
    /// Named file: streamed and buffered by the receiver.
    File(FilePayload),
    /// Unnamed binary: streamed and buffered by the receiver.
    Blob(FilePayload),
    /// Live stream handed to the handler as it arrives.
    Stream(StreamSource),
}

impl RequestBody {
    pub fn empty() -> Self {
        RequestBody::Plain(Value::Null)
    }

    pub fn is_streamed(&self) -> bool {
        !matches!(self, RequestBody::Plain(_))
    }

    pub fn as_plain(&self) -> Option<&Value> {
        match self {
            RequestBody::Plain(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for RequestBody {
    fn from(v: Value) -> Self {
        RequestBody::Plain(v)
    }
}

impl From<FilePayload> for RequestBody {
    fn from(f: FilePayload) -> Self {
        if f.name.is_some() {
            RequestBody::File(f)
        } else {
            RequestBody::Blob(f)
        }
    }
}

impl From<StreamSource> for RequestBody {
    fn from(s: StreamSource) -> Self {
        RequestBody::Stream(s)
    }
}

/// What a successful request produced.
#[derive(Debug)]
pub enum ResponseBody {
    Data(Value),
    File(FilePayload),
    Stream(BodyStream),
}

impl ResponseBody {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            ResponseBody::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_file(self) -> Option<FilePayload> {
        match self {
            ResponseBody::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<BodyStream> {
        match self {
            ResponseBody::Stream(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub request_id: String,
    pub path: String,
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: ResponseBody,
    /// Server instance that answered.
    pub responder: Option<String>,
}

impl Response {
    pub fn data(&self) -> Option<&Value> {
        self.body.as_data()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Outcome of `send`: the full response, or only its body when the client
/// is configured with `return_data`.
#[derive(Debug)]
pub enum Reply {
    Full(Response),
    Data(ResponseBody),
}

impl Reply {
    pub fn data(&self) -> Option<&Value> {
        match self {
            Reply::Full(r) => r.data(),
            Reply::Data(b) => b.as_data(),
        }
    }

    pub fn into_body(self) -> ResponseBody {
        match self {
            Reply::Full(r) => r.body,
            Reply::Data(b) => b,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Reply::Full(r) => Some(r),
            Reply::Data(_) => None,
        }
    }
}
