//! In-process window system.
//!
//! Each [`MemoryWindow`] plays one browsing context with a fixed origin.
//! Posting follows postMessage rules: the origin hint must be `*` or equal
//! the target's origin, otherwise the message is silently dropped. Delivery
//! to each listener is FIFO and never blocks the sender.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{InboundEvent, ListenerId, PeerId, Transport, TransportError};

struct WindowSlot {
    origin: String,
    closed: AtomicBool,
    listeners: DashMap<u64, mpsc::UnboundedSender<InboundEvent>>,
}

/// Registry of in-process windows.
#[derive(Default)]
pub struct MemoryHub {
    windows: DashMap<PeerId, Arc<WindowSlot>>,
    seq: AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a new window with the given origin (e.g. `https://app.test`).
    pub fn open_window(self: &Arc<Self>, origin: impl Into<String>) -> MemoryWindow {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = PeerId::new(format!("window-{n}"));
        self.windows.insert(
            id.clone(),
            Arc::new(WindowSlot {
                origin: origin.into(),
                closed: AtomicBool::new(false),
                listeners: DashMap::new(),
            }),
        );
        MemoryWindow {
            hub: Arc::clone(self),
            key: format!("memory:{id}"),
            id,
        }
    }

    /// Close a window: later posts to it fail with `Closed`.
    pub fn close_window(&self, id: &PeerId) {
        if let Some(slot) = self.windows.get(id) {
            slot.closed.store(true, Ordering::Release);
            slot.listeners.clear();
        }
    }

    /// Number of live listeners on a window.
    pub fn listener_count(&self, id: &PeerId) -> usize {
        self.windows.get(id).map(|s| s.listeners.len()).unwrap_or(0)
    }

    fn slot(&self, id: &PeerId) -> Option<Arc<WindowSlot>> {
        self.windows.get(id).map(|s| Arc::clone(s.value()))
    }
}

/// One window's view of the hub.
#[derive(Clone)]
pub struct MemoryWindow {
    hub: Arc<MemoryHub>,
    id: PeerId,
    key: String,
}

impl MemoryWindow {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn origin(&self) -> String {
        self.hub
            .slot(&self.id)
            .map(|s| s.origin.clone())
            .unwrap_or_default()
    }

    pub fn close(&self) {
        self.hub.close_window(&self.id);
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Transport for MemoryWindow {
    fn key(&self) -> &str {
        &self.key
    }

    fn post(&self, target: &PeerId, payload: Value, origin_hint: &str) -> Result<(), TransportError> {
        let slot = self.hub.slot(target).ok_or(TransportError::Closed)?;
        if slot.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if slot.listeners.is_empty() {
            return Err(TransportError::NotReady);
        }
        if origin_hint != "*" && origin_hint != slot.origin {
            tracing::debug!(target = %target, origin_hint, "origin hint mismatch; message dropped");
            return Ok(());
        }

        let event = InboundEvent {
            payload,
            source: self.id.clone(),
            origin: self.origin(),
        };
        // Listener order is irrelevant: every listener sees every event.
        slot.listeners.retain(|_, tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    fn listen(&self) -> (ListenerId, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let n = self.hub.seq.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(slot) = self.hub.slot(&self.id) {
            if !slot.closed.load(Ordering::Acquire) {
                slot.listeners.insert(n, tx);
            }
        }
        (ListenerId(n), rx)
    }

    fn unlisten(&self, id: ListenerId) {
        if let Some(slot) = self.hub.slot(&self.id) {
            slot.listeners.remove(&id.0);
        }
    }
}
