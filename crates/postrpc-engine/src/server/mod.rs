//! Server routing engine.
//!
//! A [`Server`] sits on the isolation channel of its tenant key and answers
//! REQUEST envelopes: route lookup, admission through the concurrency
//! limiter, optional body-stream handshake, then the middleware chain and
//! the handler. Several servers may share one channel; the envelope claim
//! decides which one answers.

pub mod middleware;
pub mod request;
pub mod response;
pub mod router;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::task::Poll;
use std::time::Duration;

use futures_util::FutureExt;

use postrpc_core::error::{ErrorCode, Result as RpcResult};
use postrpc_core::ids;
use postrpc_core::protocol::{Envelope, MessageType, Role, StreamKind};

use crate::channel::{ChannelRegistry, IsolationChannel};
use crate::config::ServerConfig;
use crate::context::{Claim, MessageContext};
use crate::dispatch::{Disposition, MessageDispatcher, WeakDispatcher};
use crate::obs::{noop, Observer};
use crate::policy::{ConcurrencyLimiter, Ticket};
use crate::stream::{BodyStream, OpenedStream, StreamInbox, StreamTiming};
use crate::transport::Transport;

pub use middleware::{sync_handler, Handler, HandlerError, HandlerResult, Middleware, Next, SyncHandler};
pub use request::ServerRequest;
pub use response::{CookieOptions, ServerResponse};
pub use router::{Params, PathPattern, RouteTable};

/// Optional collaborators for a server.
#[derive(Default)]
pub struct ServerOptions {
    pub observer: Option<Arc<dyn Observer>>,
    /// Share one limiter between servers to bound a peer across all of them.
    pub limiter: Option<Arc<ConcurrencyLimiter>>,
    /// Runs after the allowlist.
    pub validate_origin: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
}

struct MiddlewareEntry {
    scope: Option<PathPattern>,
    middleware: Arc<dyn Middleware>,
}

/// State reachable from the dispatcher handlers. Kept apart from
/// [`ServerInner`] so handlers never own the dispatcher they sit on.
struct Shared {
    id: String,
    routes: RwLock<RouteTable<Arc<dyn Handler>>>,
    middlewares: RwLock<Vec<MiddlewareEntry>>,
    limiter: Arc<ConcurrencyLimiter>,
    ceiling: Option<usize>,
    inbox: StreamInbox,
    stream_wait: Duration,
    timing: StreamTiming,
    chunk_size: usize,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    registry: Arc<ChannelRegistry>,
    channel: Arc<IsolationChannel>,
    dispatcher: MessageDispatcher,
    shared: Arc<Shared>,
    destroyed: AtomicBool,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.dispatcher.destroy();
            self.shared.inbox.clear();
            self.registry.release(&self.channel);
        }
    }
}

impl Server {
    pub fn new(registry: &Arc<ChannelRegistry>, transport: Arc<dyn Transport>, config: ServerConfig) -> RpcResult<Self> {
        Self::with_options(registry, transport, config, ServerOptions::default())
    }

    pub fn with_options(
        registry: &Arc<ChannelRegistry>,
        transport: Arc<dyn Transport>,
        config: ServerConfig,
        opts: ServerOptions,
    ) -> RpcResult<Self> {
        config.validate()?;
        let mut origin = config.origin_policy()?;
        if let Some(v) = opts.validate_origin {
            origin = origin.with_validator(move |o: &str| v(o));
        }

        let id = config.id.clone().unwrap_or_else(|| ids::instance_id("server"));
        let channel = registry.acquire(transport, config.secret_key.as_deref());
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&channel),
            Role::Server,
            id.clone(),
            origin,
            opts.observer.unwrap_or_else(noop),
        );

        let shared = Arc::new(Shared {
            id,
            routes: RwLock::new(RouteTable::new()),
            middlewares: RwLock::new(Vec::new()),
            limiter: opts.limiter.unwrap_or_else(ConcurrencyLimiter::new),
            ceiling: config.max_concurrent_requests_per_client,
            inbox: StreamInbox::new(),
            stream_wait: config.ack_timeout(),
            timing: config.stream_timing(),
            chunk_size: config.chunk_size,
        });
        install(&dispatcher, &shared);
        if config.auto_open {
            dispatcher.open();
        }
        tracing::debug!(server_id = %shared.id, tenant = ?config.secret_key, "server created");

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                registry: Arc::clone(registry),
                channel,
                dispatcher,
                shared,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.shared.id
    }

    pub fn secret_key(&self) -> Option<&str> {
        self.inner.config.secret_key.as_deref()
    }

    pub fn channel(&self) -> &Arc<IsolationChannel> {
        &self.inner.channel
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.inner.shared.limiter
    }

    pub fn on(&self, path: &str, handler: impl Handler + 'static) {
        self.inner
            .shared
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path, Arc::new(handler));
    }

    pub fn off(&self, path: &str) -> bool {
        self.inner
            .shared
            .routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
    }

    /// Middleware for every path.
    pub fn use_middleware(&self, mw: impl Middleware + 'static) {
        self.push_middleware(None, Arc::new(mw));
    }

    /// Middleware for paths matching `pattern` (`*` matches the rest).
    pub fn use_path(&self, pattern: &str, mw: impl Middleware + 'static) {
        self.push_middleware(Some(PathPattern::parse(pattern)), Arc::new(mw));
    }

    fn push_middleware(&self, scope: Option<PathPattern>, middleware: Arc<dyn Middleware>) {
        self.inner
            .shared
            .middlewares
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(MiddlewareEntry { scope, middleware });
    }

    pub fn open(&self) {
        if !self.is_destroyed() {
            self.inner.dispatcher.open();
        }
    }

    pub fn close(&self) {
        self.inner.dispatcher.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.dispatcher.is_open()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispatcher.destroy();
        self.inner.shared.inbox.clear();
        let left = self.inner.registry.release(&self.inner.channel);
        tracing::debug!(server_id = self.id(), channel_refs = left, "server destroyed");
    }
}

fn install(dispatcher: &MessageDispatcher, shared: &Arc<Shared>) {
    let (s, weak) = (Arc::clone(shared), dispatcher.downgrade());
    dispatcher.on(
        MessageType::Request,
        Arc::new(move |env: &Envelope, ctx: &MessageContext| match weak.upgrade() {
            Some(d) => on_request(&s, &d, env, ctx),
            None => Disposition::Ignored,
        }),
    );

    let (s, weak) = (Arc::clone(shared), dispatcher.downgrade());
    dispatcher.on(
        MessageType::StreamStart,
        Arc::new(move |env: &Envelope, ctx: &MessageContext| on_stream_start(&s, &weak, env, ctx)),
    );

    let id = shared.id.clone();
    dispatcher.on_version_error(Arc::new(move |d: &MessageDispatcher, env: &Envelope, ctx: &MessageContext| {
        if env.kind != MessageType::Request || ctx.try_claim(&id) != Claim::Unclaimed {
            return;
        }
        ctx.mark_responded();
        let msg = format!("protocol version {} is not supported", env.version);
        if let Err(e) = d.reply_error(ctx, env, ErrorCode::ProtocolUnsupported, &msg) {
            tracing::debug!(error = %e, "version error not delivered");
        }
    }));
}

/// Bind a request body stream right away and park it for its request.
fn on_stream_start(shared: &Arc<Shared>, weak: &WeakDispatcher, env: &Envelope, ctx: &MessageContext) -> Disposition {
    let (Some(stream_id), Some(dispatcher)) = (env.stream_id.clone(), weak.upgrade()) else {
        return Disposition::Ignored;
    };
    let frames = dispatcher.register_stream(&stream_id);
    shared.inbox.offer(
        &stream_id,
        OpenedStream {
            start: env.clone(),
            frames,
            source: ctx.source().clone(),
            origin: ctx.origin().to_string(),
        },
    );

    // Unclaimed bodies (another instance took the request) are released.
    let (s, weak, wait) = (Arc::clone(shared), weak.clone(), shared.stream_wait);
    tokio::spawn(async move {
        tokio::time::sleep(wait * 2).await;
        if let Some(d) = weak.upgrade() {
            if s.inbox.expire(&stream_id, &d) {
                tracing::debug!(stream_id, "unclaimed request stream released");
            }
        }
    });
    Disposition::Handled
}

fn on_request(shared: &Arc<Shared>, dispatcher: &MessageDispatcher, env: &Envelope, ctx: &MessageContext) -> Disposition {
    let path = env.path.clone().unwrap_or_default();
    let resolved = shared
        .routes
        .read()
        .ok()
        .and_then(|t| t.resolve(&path).map(|(h, p)| (Arc::clone(h), p)));

    let Some((handler, params)) = resolved else {
        let (d, req, source, origin) = (dispatcher.clone(), env.clone(), ctx.source().clone(), ctx.origin().to_string());
        ctx.defer_unclaimed(move || {
            let msg = format!("no handler for {}", req.path.as_deref().unwrap_or_default());
            let mut err = Envelope::error(req.request_id.clone(), &ErrorCode::MethodNotFound, msg, 404);
            err.path = req.path.clone();
            err.target_id = req.creator_id.clone();
            if let Err(e) = d.send(&source, err, &origin) {
                tracing::debug!(error = %e, "not-found reply not delivered");
            }
        });
        return Disposition::Ignored;
    };

    if let Claim::ClaimedBy(owner) = ctx.try_claim(&shared.id) {
        tracing::trace!(request_id = %env.request_id, owner = %owner, "request handled by another instance");
        return Disposition::Ignored;
    }

    let ticket = match shared.ceiling {
        Some(ceiling) => {
            let client = env.creator_id.as_deref().unwrap_or("anonymous");
            match shared.limiter.acquire(ctx.origin(), client, ceiling) {
                Some(t) => Some(t),
                None => {
                    tracing::warn!(origin = ctx.origin(), client, ceiling, "too many concurrent requests");
                    ctx.mark_responded();
                    if let Err(e) = dispatcher.reply_error(ctx, env, ErrorCode::TooManyRequests, "too many concurrent requests") {
                        tracing::debug!(error = %e, "limiter reply not delivered");
                    }
                    return Disposition::Handled;
                }
            }
        }
        None => None,
    };

    let chain: Vec<_> = shared
        .middlewares
        .read()
        .map(|m| {
            m.iter()
                .filter(|e| e.scope.as_ref().map(|p| p.matches(&path).is_some()).unwrap_or(true))
                .map(|e| Arc::clone(&e.middleware))
                .collect()
        })
        .unwrap_or_default();

    let res = ServerResponse::new(
        dispatcher.clone(),
        ctx.source().clone(),
        ctx.origin().to_string(),
        env,
        shared.chunk_size,
    );
    let req = ServerRequest {
        request_id: env.request_id.clone(),
        path,
        params,
        body: env.body.clone().unwrap_or_default(),
        file: None,
        stream: None,
        headers: env.headers.clone().unwrap_or_default(),
        cookies: env.cookies.clone().unwrap_or_default(),
        origin: ctx.origin().to_string(),
        source: ctx.source().clone(),
        creator_id: env.creator_id.clone(),
    };

    let work = run_request(
        Arc::clone(shared),
        dispatcher.clone(),
        env.stream_id.clone(),
        req,
        res,
        Next::new(chain, handler),
        ticket,
    );
    Disposition::Accepted(Some(Box::pin(work)))
}

async fn run_request(
    shared: Arc<Shared>,
    dispatcher: MessageDispatcher,
    stream_id: Option<String>,
    mut req: ServerRequest,
    res: ServerResponse,
    next: Next,
    ticket: Option<Ticket>,
) {
    let _ticket = ticket;

    if let Some(stream_id) = stream_id {
        let Some(opened) = shared.inbox.wait(&stream_id, shared.stream_wait).await else {
            res.send_error(ErrorCode::StreamStartTimeout, "request body stream never started", Some(408));
            return;
        };
        let reader = match BodyStream::new(dispatcher, opened, shared.timing) {
            Ok(r) => r,
            Err(e) => {
                res.send_error(e.code.clone(), &e.message, None);
                return;
            }
        };
        if reader.kind() == StreamKind::File && reader.auto_resolve() {
            match reader.into_file().await {
                Ok(file) => req.file = Some(file),
                Err(e) => {
                    res.send_error(e.code.clone(), &e.message, None);
                    return;
                }
            }
        } else {
            req.stream = Some(reader);
        }
    }

    let fut = AssertUnwindSafe(next.run(req, res.clone())).catch_unwind();
    futures_util::pin_mut!(fut);
    let outcome = match futures_util::poll!(fut.as_mut()) {
        Poll::Ready(out) => out,
        Poll::Pending => {
            res.notify_async();
            fut.await
        }
    };

    match outcome {
        Err(_) => {
            tracing::error!(request_id = res.request_id(), "handler panicked");
            res.send_error(ErrorCode::RequestError, "internal error", Some(500));
        }
        Ok(Ok(Some(value))) => {
            res.send(value);
        }
        Ok(Ok(None)) => {
            res.send_error(ErrorCode::NoResponse, "handler sent no response", Some(500));
        }
        Ok(Err(e)) => {
            let status = match res.explicit_status() {
                Some(s) if s >= 400 => s,
                _ => e.status.unwrap_or(500),
            };
            res.send_error(e.code, &e.message, Some(status));
        }
    }
}
