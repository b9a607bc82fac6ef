//! Transport seam.
//!
//! The engine only needs a fire-and-forget `post` and a stream of inbound
//! events; everything else about how bytes cross window boundaries stays in
//! the binding. [`memory`] provides an in-process binding used by tests and
//! the demo binary.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use postrpc_core::error::RpcError;

/// Opaque reference to a peer window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound transport event.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub payload: Value,
    pub source: PeerId,
    pub origin: String,
}

/// Handle returned by [`Transport::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Why a post could not be handed to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Peer exists but is not accepting messages yet.
    NotReady,
    /// Peer is gone.
    Closed,
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotReady => RpcError::NotReady,
            TransportError::Closed => RpcError::TargetClosed,
        }
    }
}

/// Raw duplex transport (window-to-window message passing).
pub trait Transport: Send + Sync {
    /// Identity of this binding; channels are shared per `(key, tenant)`.
    fn key(&self) -> &str;

    /// Fire-and-forget send. `origin_hint` of `"*"` matches any origin.
    fn post(&self, target: &PeerId, payload: Value, origin_hint: &str) -> Result<(), TransportError>;

    /// Subscribe to every inbound event for this binding.
    fn listen(&self) -> (ListenerId, mpsc::UnboundedReceiver<InboundEvent>);

    /// Drop a subscription created by [`Transport::listen`].
    fn unlisten(&self, id: ListenerId);
}
