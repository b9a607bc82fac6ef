//! Parking spot for `stream_start` frames that arrive before the request
//! that refers to them is processed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use super::OpenedStream;
use crate::dispatch::MessageDispatcher;

#[derive(Default)]
struct Slots {
    parked: HashMap<String, OpenedStream>,
    waiters: HashMap<String, oneshot::Sender<OpenedStream>>,
}

#[derive(Default)]
pub struct StreamInbox {
    slots: Mutex<Slots>,
}

impl StreamInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a freshly bound stream to its waiter, or park it.
    pub fn offer(&self, stream_id: &str, opened: OpenedStream) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let opened = match slots.waiters.remove(stream_id) {
            Some(tx) => match tx.send(opened) {
                Ok(()) => return,
                Err(opened) => opened,
            },
            None => opened,
        };
        slots.parked.insert(stream_id.to_string(), opened);
    }

    /// Wait for `stream_id` to be offered, at most `wait`.
    pub async fn wait(&self, stream_id: &str, wait: Duration) -> Option<OpenedStream> {
        let rx = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(opened) = slots.parked.remove(stream_id) {
                return Some(opened);
            }
            let (tx, rx) = oneshot::channel();
            slots.waiters.insert(stream_id.to_string(), tx);
            rx
        };
        let got = tokio::time::timeout(wait, rx).await.ok().and_then(Result::ok);
        if got.is_none() {
            self.slots
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .waiters
                .remove(stream_id);
        }
        got
    }

    /// Drop a parked stream nobody asked for and release its binding.
    pub fn expire(&self, stream_id: &str, dispatcher: &MessageDispatcher) -> bool {
        let parked = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .parked
            .remove(stream_id);
        match parked {
            Some(_) => {
                dispatcher.unregister_stream(stream_id);
                true
            }
            None => false,
        }
    }

    pub fn parked(&self) -> usize {
        self.slots.lock().map(|s| s.parked.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.parked.clear();
        slots.waiters.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use postrpc_core::protocol::{Envelope, MessageType};
    use tokio::sync::mpsc;

    use crate::transport::PeerId;

    fn opened(id: &str) -> OpenedStream {
        let (_tx, frames) = mpsc::unbounded_channel();
        OpenedStream {
            start: Envelope::new(MessageType::StreamStart, "r").with_stream_id(id),
            frames,
            source: PeerId::new("window-1"),
            origin: "https://a.test".into(),
        }
    }

    #[tokio::test]
    async fn early_offer_is_parked_until_asked_for() {
        let inbox = StreamInbox::new();
        inbox.offer("s1", opened("s1"));
        assert_eq!(inbox.parked(), 1);
        let got = inbox.wait("s1", Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.start.stream_id.as_deref(), Some("s1"));
        assert_eq!(inbox.parked(), 0);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_late_offer() {
        let inbox = std::sync::Arc::new(StreamInbox::new());
        let waiter = {
            let inbox = inbox.clone();
            tokio::spawn(async move { inbox.wait("s2", Duration::from_secs(1)).await.is_some() })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        inbox.offer("s2", opened("s2"));
        assert!(waiter.await.unwrap());
        assert!(inbox.wait("s3", Duration::from_millis(5)).await.is_none());
    }
}
