//! Isolation channels: tenant-filtered, ref-counted views of one transport.
//!
//! A channel owns the transport listener, admits only well-formed envelopes
//! whose tenant key matches its own, and fans each event out to every
//! registered receiver. It performs no protocol semantics itself.

pub mod isolation;
pub mod registry;

pub use isolation::{ChannelReceiver, IsolationChannel, ReceiverId};
pub use registry::ChannelRegistry;
