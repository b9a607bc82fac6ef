//! postrpc core: wire envelope, stream frame bodies, payloads and error types.
//!
//! This crate defines the wire-level contracts and error surface shared by the
//! engine and the facade. It carries no runtime or transport dependencies so it
//! can be reused by any binding.
//!
//! # Guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here.
//! All fallible paths surface as `RpcError`/`Result` so malformed traffic from
//! an untrusted peer never brings the process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod ids;
pub mod protocol;

/// Shared result type.
pub use error::{ErrorCode, RequestError, Result, RpcError};
