//! Per-peer admission control.
//!
//! A counter per `(bucket, key)` with a caller-supplied ceiling. Acquire is
//! non-blocking: over the ceiling the caller is refused immediately and the
//! counter is left untouched. There is no queue.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct ConcurrencyLimiter {
    counters: DashMap<(String, String), usize>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(&self, bucket: &str, key: &str, ceiling: usize) -> bool {
        match self.counters.entry((bucket.to_string(), key.to_string())) {
            Entry::Occupied(mut e) => {
                if *e.get() >= ceiling {
                    return false;
                }
                *e.get_mut() += 1;
                true
            }
            Entry::Vacant(e) => {
                if ceiling == 0 {
                    return false;
                }
                e.insert(1);
                true
            }
        }
    }

    pub fn release(&self, bucket: &str, key: &str) {
        if let Entry::Occupied(mut e) = self.counters.entry((bucket.to_string(), key.to_string())) {
            if *e.get() <= 1 {
                e.remove();
            } else {
                *e.get_mut() -= 1;
            }
        }
    }

    pub fn in_flight(&self, bucket: &str, key: &str) -> usize {
        self.counters
            .get(&(bucket.to_string(), key.to_string()))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// RAII form of `try_acquire`; the slot is released on drop.
    pub fn acquire(self: &Arc<Self>, bucket: &str, key: &str, ceiling: usize) -> Option<Ticket> {
        self.try_acquire(bucket, key, ceiling).then(|| Ticket {
            limiter: Arc::clone(self),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

/// One admitted in-flight request.
#[derive(Debug)]
pub struct Ticket {
    limiter: Arc<ConcurrencyLimiter>,
    bucket: String,
    key: String,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.limiter.release(&self.bucket, &self.key);
    }
}
