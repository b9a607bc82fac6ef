//! Tenant-keyed channels over one transport, shared through a ref-counted
//! registry. A channel drops envelopes that fail validation or carry another
//! tenant's key before any receiver sees them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::task::JoinHandle;

use postrpc_core::error::{Result, RpcError};
use postrpc_core::protocol::{is_valid_envelope, Envelope};

use crate::context::MessageContext;
use crate::transport::{InboundEvent, ListenerId, PeerId, Transport};

/// Something that consumes admitted envelopes (a dispatcher).
pub trait ChannelReceiver: Send + Sync {
    fn receive(&self, env: &Envelope, ctx: &MessageContext);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

/// Key identifying a shared channel: transport binding + tenant key.
pub(crate) type ChannelKey = (String, Option<String>);

pub struct IsolationChannel {
    tenant_key: Option<String>,
    transport: Arc<dyn Transport>,
    receivers: RwLock<Vec<(ReceiverId, Arc<dyn ChannelReceiver>)>>,
    refs: AtomicUsize,
    seq: AtomicU64,
    listener: Mutex<Option<(ListenerId, JoinHandle<()>)>>,
}

impl IsolationChannel {
    /// Bind a new channel to `transport`. Must run inside a tokio runtime.
    pub fn open(transport: Arc<dyn Transport>, tenant_key: Option<String>) -> Arc<Self> {
        let (listener_id, mut rx) = transport.listen();
        let channel = Arc::new(Self {
            tenant_key,
            transport,
            receivers: RwLock::new(Vec::new()),
            refs: AtomicUsize::new(0),
            seq: AtomicU64::new(1),
            listener: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&channel);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(channel) = weak.upgrade() else { break };
                channel.deliver(event);
            }
        });
        *channel.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some((listener_id, pump));

        tracing::debug!(key = %channel.transport.key(), tenant = ?channel.tenant_key, "isolation channel opened");
        channel
    }

    pub fn tenant_key(&self) -> Option<&str> {
        self.tenant_key.as_deref()
    }

    pub(crate) fn key(&self) -> ChannelKey {
        (self.transport.key().to_string(), self.tenant_key.clone())
    }

    /// Stamp the tenant key and post. Fails if the peer is unreachable.
    pub fn send(&self, target: &PeerId, mut env: Envelope, origin_hint: &str) -> Result<()> {
        env.tenant_key = self.tenant_key.clone();
        let payload = env.to_value()?;
        self.transport
            .post(target, payload, origin_hint)
            .map_err(RpcError::from)
    }

    pub fn add_receiver(&self, receiver: Arc<dyn ChannelReceiver>) -> ReceiverId {
        let id = ReceiverId(self.seq.fetch_add(1, Ordering::Relaxed));
        self.receivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, receiver));
        id
    }

    pub fn remove_receiver(&self, id: ReceiverId) {
        self.receivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(rid, _)| *rid != id);
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn add_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference and return how many remain.
    pub fn release(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Remove the transport listener and forget all receivers.
    pub(crate) fn destroy(&self) {
        if let Some((id, pump)) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.transport.unlisten(id);
            pump.abort();
        }
        self.receivers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::debug!(key = %self.transport.key(), tenant = ?self.tenant_key, "isolation channel destroyed");
    }

    /// Admission + tenant filter + fan-out for one transport event.
    pub(crate) fn deliver(&self, event: InboundEvent) {
        if !is_valid_envelope(&event.payload) {
            return;
        }
        let env = match Envelope::from_value(event.payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(error = %e, "undecodable envelope dropped");
                return;
            }
        };
        if env.tenant_key != self.tenant_key {
            return;
        }

        let ctx = MessageContext::new(event.source, event.origin);
        let receivers: Vec<Arc<dyn ChannelReceiver>> = self
            .receivers
            .read()
            .map(|r| r.iter().map(|(_, r)| Arc::clone(r)).collect())
            .unwrap_or_default();

        for receiver in receivers {
            if catch_unwind(AssertUnwindSafe(|| receiver.receive(&env, &ctx))).is_err() {
                tracing::error!(request_id = %env.request_id, kind = env.kind.as_str(), "channel receiver panicked");
            }
        }
        ctx.finish();
    }
}

impl Drop for IsolationChannel {
    fn drop(&mut self) {
        if let Some((id, pump)) = self
            .listener
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.transport.unlisten(id);
            pump.abort();
        }
    }
}
