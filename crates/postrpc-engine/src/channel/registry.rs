//! Process-wide channel registry.
//!
//! One channel per `(transport key, tenant key)`, created on first
//! `acquire`, destroyed when the last reference is released. Pass a shared
//! `Arc<ChannelRegistry>` into every client/server of a process; tests create
//! their own to stay isolated.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::isolation::{ChannelKey, IsolationChannel};
use crate::transport::Transport;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<ChannelKey, Arc<IsolationChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get or create the channel for `(transport, tenant_key)` and take a reference.
    pub fn acquire(&self, transport: Arc<dyn Transport>, tenant_key: Option<&str>) -> Arc<IsolationChannel> {
        let key: ChannelKey = (transport.key().to_string(), tenant_key.map(str::to_string));
        let entry = self
            .channels
            .entry(key)
            .or_insert_with(|| IsolationChannel::open(transport, tenant_key.map(str::to_string)));
        entry.add_ref();
        Arc::clone(entry.value())
    }

    /// Release one reference; the channel is torn down at zero.
    pub fn release(&self, channel: &Arc<IsolationChannel>) -> usize {
        match self.channels.entry(channel.key()) {
            Entry::Occupied(e) if Arc::ptr_eq(e.get(), channel) => {
                let left = e.get().release();
                if left == 0 {
                    let (_, ch) = e.remove_entry();
                    ch.destroy();
                }
                left
            }
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
