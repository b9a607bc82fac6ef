//! Pending request table and the dispatcher handlers feeding it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use postrpc_core::protocol::{Envelope, MessageType};

use crate::context::MessageContext;
use crate::dispatch::{Disposition, MessageDispatcher};
use crate::stream::OpenedStream;

/// Correlated envelope for one pending request.
pub(crate) enum Inbound {
    Ack(Envelope),
    Async,
    Result(Envelope),
    Stream(OpenedStream),
}

#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    waiters: Arc<DashMap<String, mpsc::UnboundedSender<Inbound>>>,
}

impl PendingTable {
    pub(crate) fn register(&self, request_id: &str) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.insert(request_id.to_string(), tx);
        rx
    }

    pub(crate) fn unregister(&self, request_id: &str) {
        self.waiters.remove(request_id);
    }

    pub(crate) fn contains(&self, request_id: &str) -> bool {
        self.waiters.contains_key(request_id)
    }

    fn forward(&self, request_id: &str, inbound: Inbound) -> Result<(), Inbound> {
        match self.waiters.get(request_id) {
            Some(tx) => tx.send(inbound).map_err(|e| e.0),
            None => Err(inbound),
        }
    }

    /// Drop every waiter; their drivers observe a closed channel.
    pub(crate) fn clear(&self) {
        self.waiters.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Register the response-side type handlers on a client dispatcher.
pub(crate) fn install(dispatcher: &MessageDispatcher, table: &PendingTable) {
    for kind in [MessageType::Ack, MessageType::Async, MessageType::Response, MessageType::Error] {
        let table = table.clone();
        dispatcher.on(
            kind,
            Arc::new(move |env: &Envelope, _: &MessageContext| {
                let inbound = match env.kind {
                    MessageType::Ack => Inbound::Ack(env.clone()),
                    MessageType::Async => Inbound::Async,
                    _ => Inbound::Result(env.clone()),
                };
                match table.forward(&env.request_id, inbound) {
                    Ok(()) => Disposition::Handled,
                    Err(_) => Disposition::Ignored,
                }
            }),
        );
    }

    let table = table.clone();
    let weak = dispatcher.downgrade();
    dispatcher.on(
        MessageType::StreamStart,
        Arc::new(move |env: &Envelope, ctx: &MessageContext| {
            let Some(stream_id) = env.stream_id.as_deref() else {
                return Disposition::Ignored;
            };
            if !table.contains(&env.request_id) {
                return Disposition::Ignored;
            }
            let Some(dispatcher) = weak.upgrade() else {
                return Disposition::Ignored;
            };
            // Bind before returning so frames right behind the start are queued.
            let frames = dispatcher.register_stream(stream_id);
            let opened = OpenedStream {
                start: env.clone(),
                frames,
                source: ctx.source().clone(),
                origin: ctx.origin().to_string(),
            };
            match table.forward(&env.request_id, Inbound::Stream(opened)) {
                Ok(()) => Disposition::Handled,
                Err(_) => {
                    dispatcher.unregister_stream(stream_id);
                    Disposition::Ignored
                }
            }
        }),
    );
}
