use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::transport::PeerId;

/// Ownership of an inbound envelope among co-located instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Unclaimed,
    ClaimedBy(Arc<str>),
}

type Deferred = Box<dyn FnOnce() + Send>;

/// Context of one inbound transport event, handed to every receiver in turn.
pub struct MessageContext {
    source: PeerId,
    origin: String,
    claim: OnceLock<Arc<str>>,
    accepted: AtomicBool,
    responded: AtomicBool,
    fallback: Mutex<Option<Deferred>>,
}

impl MessageContext {
    pub fn new(source: PeerId, origin: impl Into<String>) -> Self {
        Self {
            source,
            origin: origin.into(),
            claim: OnceLock::new(),
            accepted: AtomicBool::new(false),
            responded: AtomicBool::new(false),
            fallback: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &PeerId {
        &self.source
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn claim_state(&self) -> Claim {
        match self.claim.get() {
            Some(id) => Claim::ClaimedBy(Arc::clone(id)),
            None => Claim::Unclaimed,
        }
    }

    /// Claim the envelope for `id`.
    ///
    /// Returns the state observed before the attempt: `Unclaimed` means the
    /// caller now owns the envelope, `ClaimedBy` names the earlier winner.
    pub fn try_claim(&self, id: &str) -> Claim {
        match self.claim.set(Arc::from(id)) {
            Ok(()) => Claim::Unclaimed,
            Err(_) => self.claim_state(),
        }
    }

    /// Delivery confirmed: the dispatcher acks after the handler returns.
    pub fn accept(&self) {
        self.accepted.store(true, Ordering::Release);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn mark_responded(&self) {
        self.responded.store(true, Ordering::Release);
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Register work to run once every receiver has seen the event, but only
    /// if nobody claimed it. The first registration wins.
    pub fn defer_unclaimed(&self, f: impl FnOnce() + Send + 'static) {
        let mut slot = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(Box::new(f));
        }
    }

    /// Run the deferred fallback if the event is still unclaimed.
    pub(crate) fn finish(&self) {
        let deferred = self
            .fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(f) = deferred {
            if self.claim.get().is_none() {
                f();
            }
        }
    }
}
