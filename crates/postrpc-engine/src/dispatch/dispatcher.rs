//! Type-keyed message dispatcher.
//!
//! Gates run in order: own role, `targetId`, origin, protocol version.
//! Envelopes that pass are routed to stream consumers, ping/pong waiters or
//! the registered type handler.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use postrpc_core::error::{ErrorCode, Result};
use postrpc_core::ids;
use postrpc_core::protocol::{Envelope, MessageType, Role, MIN_SUPPORTED_VERSION};

use crate::channel::{ChannelReceiver, IsolationChannel, ReceiverId};
use crate::context::MessageContext;
use crate::obs::{DropReason, Observer};
use crate::policy::OriginPolicy;
use crate::transport::PeerId;

/// What a type handler did with an envelope.
pub enum Disposition {
    /// Not for us; no side effects.
    Ignored,
    /// Consumed synchronously (reply already sent or nothing to send).
    Handled,
    /// Delivery accepted. The dispatcher acks if asked to, then spawns the work.
    Accepted(Option<BoxFuture<'static, ()>>),
}

/// One handler per envelope type.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, env: &Envelope, ctx: &MessageContext) -> Disposition;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope, &MessageContext) -> Disposition + Send + Sync,
{
    fn handle(&self, env: &Envelope, ctx: &MessageContext) -> Disposition {
        self(env, ctx)
    }
}

/// Called instead of the type handler for envelopes below the minimum version.
pub type VersionErrorHook = Arc<dyn Fn(&MessageDispatcher, &Envelope, &MessageContext) + Send + Sync>;

/// Type-keyed dispatcher sitting on one isolation channel.
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    instance_id: Arc<str>,
    role: Role,
    channel: Arc<IsolationChannel>,
    origin: OriginPolicy,
    observer: Arc<dyn Observer>,
    handlers: DashMap<MessageType, Arc<dyn MessageHandler>>,
    streams: DashMap<String, mpsc::UnboundedSender<Envelope>>,
    pongs: DashMap<String, oneshot::Sender<()>>,
    version_error: RwLock<Option<VersionErrorHook>>,
    receiver: Mutex<Option<ReceiverId>>,
}

/// Non-owning handle, for handlers that need the dispatcher they are
/// registered on.
#[derive(Clone)]
pub struct WeakDispatcher(Weak<DispatcherInner>);

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<MessageDispatcher> {
        self.0.upgrade().map(|inner| MessageDispatcher { inner })
    }
}

/// Registered on the channel; holds the dispatcher weakly so the channel
/// never keeps a closed dispatcher alive.
struct Inlet(Weak<DispatcherInner>);

impl ChannelReceiver for Inlet {
    fn receive(&self, env: &Envelope, ctx: &MessageContext) {
        if let Some(inner) = self.0.upgrade() {
            MessageDispatcher { inner }.receive(env, ctx);
        }
    }
}

impl MessageDispatcher {
    pub fn new(
        channel: Arc<IsolationChannel>,
        role: Role,
        instance_id: impl Into<Arc<str>>,
        origin: OriginPolicy,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                instance_id: instance_id.into(),
                role,
                channel,
                origin,
                observer,
                handlers: DashMap::new(),
                streams: DashMap::new(),
                pongs: DashMap::new(),
                version_error: RwLock::new(None),
                receiver: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher(Arc::downgrade(&self.inner))
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn channel(&self) -> &Arc<IsolationChannel> {
        &self.inner.channel
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.inner.observer
    }

    /// Start receiving from the channel. Idempotent.
    pub fn open(&self) {
        let mut slot = self.inner.receiver.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            let inlet = Arc::new(Inlet(Arc::downgrade(&self.inner)));
            *slot = Some(self.inner.channel.add_receiver(inlet));
        }
    }

    /// Stop receiving. Registered handlers are kept.
    pub fn close(&self) {
        let taken = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = taken {
            self.inner.channel.remove_receiver(id);
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .receiver
            .lock()
            .map(|r| r.is_some())
            .unwrap_or(false)
    }

    /// Close and fail everything waiting on this dispatcher.
    pub fn destroy(&self) {
        self.close();
        self.inner.streams.clear();
        self.inner.pongs.clear();
        self.inner.handlers.clear();
    }

    pub fn on(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.insert(kind, handler);
    }

    pub fn off(&self, kind: MessageType) {
        self.inner.handlers.remove(&kind);
    }

    pub fn on_version_error(&self, hook: VersionErrorHook) {
        *self
            .inner
            .version_error
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Stamp role/creator and post through the channel.
    pub fn send(&self, target: &PeerId, mut env: Envelope, origin_hint: &str) -> Result<()> {
        env.role = Some(self.inner.role);
        if env.creator_id.is_none() {
            env.creator_id = Some(self.inner.instance_id.to_string());
        }
        self.inner.observer.on_outbound(&env);
        self.inner.channel.send(target, env, origin_hint)
    }

    /// Reply to the sender of `req` (addressed to its creator instance).
    pub fn reply(&self, ctx: &MessageContext, req: &Envelope, mut env: Envelope) -> Result<()> {
        env.target_id = req.creator_id.clone();
        if env.path.is_none() {
            env.path = req.path.clone();
        }
        self.send(ctx.source(), env, ctx.origin())
    }

    pub fn reply_error(&self, ctx: &MessageContext, req: &Envelope, code: ErrorCode, message: &str) -> Result<()> {
        let status = code.default_status();
        let env = Envelope::error(req.request_id.clone(), &code, message, status);
        self.reply(ctx, req, env)
    }

    /// Bind a consumer to `stream_id`. Frames arriving afterwards are queued in order.
    pub fn register_stream(&self, stream_id: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.streams.insert(stream_id.to_string(), tx);
        rx
    }

    /// Returns true the first time only.
    pub fn unregister_stream(&self, stream_id: &str) -> bool {
        self.inner.streams.remove(stream_id).is_some()
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.inner.streams.contains_key(stream_id)
    }

    /// Round-trip a ping to `target`. False if no pong arrives within `wait`.
    pub async fn ping(&self, target: &PeerId, origin_hint: &str, target_id: Option<String>, wait: Duration) -> bool {
        let request_id = ids::request_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pongs.insert(request_id.clone(), tx);

        let mut env = Envelope::new(MessageType::Ping, request_id.clone());
        env.target_id = target_id;
        if self.send(target, env, origin_hint).is_err() {
            self.inner.pongs.remove(&request_id);
            return false;
        }

        let ok = matches!(tokio::time::timeout(wait, rx).await, Ok(Ok(())));
        self.inner.pongs.remove(&request_id);
        ok
    }

    fn drop_envelope(&self, env: &Envelope, reason: DropReason) {
        self.inner.observer.on_dropped(env, reason);
    }

    fn receive(&self, env: &Envelope, ctx: &MessageContext) {
        // Our own side's traffic (same-window peers) is never for us.
        if env.role == Some(self.inner.role) {
            return;
        }
        self.inner.observer.on_inbound(env, ctx);

        if let Some(target) = env.target_id.as_deref() {
            if target != &*self.inner.instance_id {
                self.drop_envelope(env, DropReason::WrongTarget);
                return;
            }
        }

        if !self.inner.origin.allows(ctx.origin()) {
            self.drop_envelope(env, DropReason::OriginRejected);
            return;
        }

        // Only peers that passed the target and origin gates hear about versions.
        if env.version < MIN_SUPPORTED_VERSION {
            self.drop_envelope(env, DropReason::UnsupportedVersion);
            let hook = self
                .inner
                .version_error
                .read()
                .ok()
                .and_then(|h| h.clone());
            if let Some(hook) = hook {
                hook(self, env, ctx);
            }
            return;
        }

        match env.kind {
            kind if kind.is_stream_frame() => self.route_stream_frame(env),
            MessageType::Ping => {
                let pong = Envelope::new(MessageType::Pong, env.request_id.clone());
                if let Err(e) = self.reply(ctx, env, pong) {
                    tracing::debug!(error = %e, "pong not delivered");
                }
            }
            MessageType::Pong => match self.inner.pongs.remove(&env.request_id) {
                Some((_, tx)) => {
                    let _ = tx.send(());
                }
                None => self.drop_envelope(env, DropReason::Unhandled),
            },
            kind => self.run_handler(kind, env, ctx),
        }
    }

    fn route_stream_frame(&self, env: &Envelope) {
        let Some(stream_id) = env.stream_id.as_deref() else {
            self.drop_envelope(env, DropReason::Unhandled);
            return;
        };
        let terminal = matches!(
            env.kind,
            MessageType::StreamEnd | MessageType::StreamError | MessageType::StreamCancel
        );
        let delivered = if terminal {
            self.inner
                .streams
                .remove(stream_id)
                .map(|(_, tx)| tx.send(env.clone()).is_ok())
        } else {
            self.inner
                .streams
                .get(stream_id)
                .map(|tx| tx.send(env.clone()).is_ok())
        };
        if delivered != Some(true) {
            self.drop_envelope(env, DropReason::Unhandled);
        }
    }

    fn run_handler(&self, kind: MessageType, env: &Envelope, ctx: &MessageContext) {
        let handler = match self.inner.handlers.get(&kind) {
            Some(h) => Arc::clone(h.value()),
            None => {
                self.drop_envelope(env, DropReason::Unhandled);
                return;
            }
        };

        match handler.handle(env, ctx) {
            Disposition::Ignored | Disposition::Handled => {}
            Disposition::Accepted(work) => {
                ctx.accept();
                if env.wants_ack() && !ctx.has_responded() {
                    let mut ack = Envelope::new(MessageType::Ack, env.request_id.clone());
                    ack.ack_token = env.ack_token.clone();
                    if let Err(e) = self.reply(ctx, env, ack) {
                        tracing::debug!(error = %e, request_id = %env.request_id, "ack not delivered");
                    }
                }
                if let Some(work) = work {
                    tokio::spawn(work);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::obs::noop;
    use crate::transport::memory::{MemoryHub, MemoryWindow};
    use crate::transport::Transport;

    struct Pair {
        _hub: Arc<MemoryHub>,
        page: MemoryWindow,
        frame: MemoryWindow,
        server: MessageDispatcher,
        client: MessageDispatcher,
    }

    fn pair() -> Pair {
        let hub = MemoryHub::new();
        let page = hub.open_window("https://page.test");
        let frame = hub.open_window("https://frame.test");
        let registry = ChannelRegistry::new();
        let server = MessageDispatcher::new(
            registry.acquire(Arc::new(frame.clone()), None),
            Role::Server,
            "server_1",
            OriginPolicy::allow_all(),
            noop(),
        );
        let client = MessageDispatcher::new(
            registry.acquire(Arc::new(page.clone()), None),
            Role::Client,
            "client_1",
            OriginPolicy::allow_all(),
            noop(),
        );
        server.open();
        client.open();
        Pair { _hub: hub, page, frame, server, client }
    }

    fn accept_all() -> Arc<dyn MessageHandler> {
        Arc::new(|_: &Envelope, _: &MessageContext| Disposition::Accepted(None))
    }

    fn capture(d: &MessageDispatcher, kind: MessageType) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        d.on(
            kind,
            Arc::new(move |env: &Envelope, _: &MessageContext| {
                let _ = tx.send(env.clone());
                Disposition::Handled
            }),
        );
        rx
    }

    #[tokio::test]
    async fn accepted_request_is_acked_with_instance_id() {
        let p = pair();
        p.server.on(MessageType::Request, accept_all());
        let mut acks = capture(&p.client, MessageType::Ack);

        let mut req = Envelope::new(MessageType::Request, "r1").with_path("x");
        req.ack_token = Some("tok".into());
        p.client.send(p.frame.id(), req, "*").unwrap();

        let ack = acks.recv().await.unwrap();
        assert_eq!(ack.request_id, "r1");
        assert_eq!(ack.creator_id.as_deref(), Some("server_1"));
        assert_eq!(ack.target_id.as_deref(), Some("client_1"));
        assert_eq!(ack.ack_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn mismatched_target_is_not_even_acked() {
        let p = pair();
        p.server.on(MessageType::Request, accept_all());
        let mut acks = capture(&p.client, MessageType::Ack);

        let mut req = Envelope::new(MessageType::Request, "r1");
        req.target_id = Some("server_2".into());
        p.client.send(p.frame.id(), req, "*").unwrap();
        let mut ok = Envelope::new(MessageType::Request, "r2");
        ok.require_ack = Some(true);
        p.client.send(p.frame.id(), ok, "*").unwrap();

        assert_eq!(acks.recv().await.unwrap().request_id, "r2");
    }

    #[tokio::test]
    async fn old_versions_go_to_the_version_hook() {
        let p = pair();
        p.server.on(MessageType::Request, accept_all());
        p.server.on_version_error(Arc::new(|d: &MessageDispatcher, env: &Envelope, ctx: &MessageContext| {
            let _ = d.reply_error(ctx, env, ErrorCode::ProtocolUnsupported, "upgrade");
        }));
        let mut errors = capture(&p.client, MessageType::Error);

        let mut req = Envelope::new(MessageType::Request, "old");
        req.version = 1;
        req.role = Some(Role::Client);
        p.page.post(p.frame.id(), req.to_value().unwrap(), "*").unwrap();

        let err = errors.recv().await.unwrap();
        assert_eq!(err.error.unwrap().code, "PROTOCOL_UNSUPPORTED");
    }

    #[tokio::test]
    async fn version_hook_runs_after_the_target_gate() {
        let p = pair();
        p.server.on_version_error(Arc::new(|d: &MessageDispatcher, env: &Envelope, ctx: &MessageContext| {
            let _ = d.reply_error(ctx, env, ErrorCode::ProtocolUnsupported, "upgrade");
        }));
        let mut errors = capture(&p.client, MessageType::Error);

        for (request_id, target) in [("elsewhere", "server_2"), ("mine", "server_1")] {
            let mut req = Envelope::new(MessageType::Request, request_id);
            req.version = 1;
            req.role = Some(Role::Client);
            req.target_id = Some(target.into());
            p.page.post(p.frame.id(), req.to_value().unwrap(), "*").unwrap();
        }

        assert_eq!(errors.recv().await.unwrap().request_id, "mine");
    }

    #[tokio::test]
    async fn ping_round_trip_and_stream_routing() {
        let p = pair();
        assert!(p.client.ping(p.frame.id(), "*", None, Duration::from_millis(500)).await);
        assert!(!p.client.ping(p.frame.id(), "*", Some("nobody".into()), Duration::from_millis(50)).await);

        let mut rx = p.server.register_stream("s1");
        let mut data = Envelope::new(MessageType::StreamData, "r").with_stream_id("s1");
        data.body = Some(serde_json::json!({"data": 1, "done": true}));
        p.client.send(p.frame.id(), data, "*").unwrap();
        p.client
            .send(p.frame.id(), Envelope::new(MessageType::StreamEnd, "r").with_stream_id("s1"), "*")
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().kind, MessageType::StreamData);
        assert_eq!(rx.recv().await.unwrap().kind, MessageType::StreamEnd);
        assert!(rx.recv().await.is_none());
        assert!(!p.server.unregister_stream("s1"));
    }
}
