//! Wire protocol: the envelope tagged union and the stream frame bodies.
//!
//! Every message crossing the transport is an [`Envelope`] serialized as a
//! JSON object. Admission is decided by [`is_valid_envelope`] before any
//! field is trusted; decoding never panics on hostile input.

pub mod envelope;
pub mod payload;
pub mod stream;

pub use envelope::{
    is_valid_envelope, Cookies, Envelope, ErrorBody, Headers, MessageType, Role,
    MIN_SUPPORTED_VERSION, PROTOCOL_VERSION, VERSION_KEY,
};
pub use payload::FilePayload;
pub use stream::{StreamDataBody, StreamKind, StreamMetadata, StreamStartBody};
