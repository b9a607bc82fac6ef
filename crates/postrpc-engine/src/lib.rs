//! postrpc engine library entry.
//!
//! This crate wires the transport seam, isolation channels, dispatcher,
//! policy, streaming sub-protocol, and the client/server engines into one
//! request/response stack over window-style message passing. It is consumed
//! by the demo binary (`main.rs`) and by integration tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod obs;
pub mod policy;
pub mod server;
pub mod stream;
pub mod transport;

pub use client::{Client, Reply, RequestBody, RequestOptions, Response, ResponseBody};
pub use server::{Server, ServerOptions, ServerRequest, ServerResponse};
