//! Client request engine.
//!
//! A [`Client`] talks to one target window. Every `send`-family call runs the
//! [`state::RequestMachine`] against envelopes correlated by `requestId`,
//! with one timer rearmed on each phase change.

pub mod body;
pub mod cookie;
pub mod interceptor;
pub(crate) mod pending;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use postrpc_core::error::{ErrorCode, ErrorResponse, RequestError, Result as RpcResult};
use postrpc_core::ids;
use postrpc_core::protocol::envelope::status_text;
use postrpc_core::protocol::{Cookies, Envelope, FilePayload, Headers, MessageType, Role, StreamKind};

use crate::channel::{ChannelRegistry, IsolationChannel};
use crate::config::ClientConfig;
use crate::dispatch::MessageDispatcher;
use crate::obs::{noop, Observer};
use crate::policy::OriginPolicy;
use crate::stream::writer::StreamRoute;
use crate::stream::{BodyStream, OpenedStream, StreamOptions, StreamSource, StreamWriter};
use crate::transport::{PeerId, Transport};

pub use body::{Reply, RequestBody, Response, ResponseBody};
pub use cookie::CookieJar;
pub use interceptor::{OutgoingRequest, RequestInterceptor, ResponseInterceptor};
pub use state::{Phase, RequestMachine, Timeouts, Transition};

use cookie::SET_COOKIE;
use interceptor::{run_request_chain, run_response_chain};
use pending::{Inbound, PendingTable};

/// Per-call overrides of the client configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: Headers,
    pub cookies: Cookies,
    pub require_ack: Option<bool>,
    pub target_id: Option<String>,
    pub ack_timeout: Option<Duration>,
    pub timeout: Option<Duration>,
    pub async_timeout: Option<Duration>,
    pub return_data: Option<bool>,
    /// Applies to `send_file` / `send_stream` bodies.
    pub stream: StreamOptions,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    target: PeerId,
    registry: Arc<ChannelRegistry>,
    channel: Arc<IsolationChannel>,
    dispatcher: MessageDispatcher,
    pending: PendingTable,
    cookies: Mutex<CookieJar>,
    request_interceptors: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    response_interceptors: RwLock<Vec<Arc<dyn ResponseInterceptor>>>,
    server_id: OnceLock<String>,
    destroyed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            self.dispatcher.destroy();
            self.registry.release(&self.channel);
        }
    }
}

fn lower_keys(headers: &Headers) -> impl Iterator<Item = (String, String)> + '_ {
    headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
}

impl Client {
    pub fn new(
        registry: &Arc<ChannelRegistry>,
        transport: Arc<dyn Transport>,
        target: PeerId,
        config: ClientConfig,
    ) -> RpcResult<Self> {
        Self::with_observer(registry, transport, target, config, noop())
    }

    pub fn with_observer(
        registry: &Arc<ChannelRegistry>,
        transport: Arc<dyn Transport>,
        target: PeerId,
        config: ClientConfig,
        observer: Arc<dyn Observer>,
    ) -> RpcResult<Self> {
        config.validate()?;
        let origin = if config.target_origin == "*" {
            OriginPolicy::allow_all()
        } else {
            OriginPolicy::from_allowlist(std::slice::from_ref(&config.target_origin))?
        };

        let channel = registry.acquire(transport, config.secret_key.as_deref());
        let dispatcher = MessageDispatcher::new(
            Arc::clone(&channel),
            Role::Client,
            ids::instance_id("client"),
            origin,
            observer,
        );
        let pending = PendingTable::default();
        pending::install(&dispatcher, &pending);
        if config.auto_open {
            dispatcher.open();
        }
        tracing::debug!(client_id = dispatcher.id(), target = %target, tenant = ?config.secret_key, "client created");

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                target,
                registry: Arc::clone(registry),
                channel,
                dispatcher,
                pending,
                cookies: Mutex::new(CookieJar::new()),
                request_interceptors: RwLock::new(Vec::new()),
                response_interceptors: RwLock::new(Vec::new()),
                server_id: OnceLock::new(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        self.inner.dispatcher.id()
    }

    pub fn secret_key(&self) -> Option<&str> {
        self.inner.config.secret_key.as_deref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn channel(&self) -> &Arc<IsolationChannel> {
        &self.inner.channel
    }

    /// First server instance that acknowledged one of our requests.
    pub fn server_id(&self) -> Option<&str> {
        self.inner.server_id.get().map(String::as_str)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
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

    /// Reject all pending work with `CLIENT_DESTROYED` and release the channel.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispatcher.destroy();
        self.inner.pending.clear();
        let left = self.inner.registry.release(&self.inner.channel);
        tracing::debug!(client_id = self.id(), channel_refs = left, "client destroyed");
    }

    pub fn use_request(&self, interceptor: Arc<dyn RequestInterceptor>) {
        self.inner
            .request_interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(interceptor);
    }

    pub fn use_response(&self, interceptor: Arc<dyn ResponseInterceptor>) {
        self.inner
            .response_interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(interceptor);
    }

    fn jar(&self) -> std::sync::MutexGuard<'_, CookieJar> {
        self.inner.cookies.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_cookie(&self, name: &str, path: Option<&str>) -> Option<String> {
        self.jar().get(name, path)
    }

    pub fn set_cookie(&self, name: &str, value: &str, path: Option<&str>) {
        self.jar().set(name, value, path);
    }

    pub fn remove_cookie(&self, name: &str, path: Option<&str>) {
        self.jar().remove(name, path);
    }

    pub fn clear_cookies(&self) {
        self.jar().clear();
    }

    pub fn cookies(&self) -> Cookies {
        self.jar().all()
    }

    fn target_id(&self, explicit: Option<String>) -> Option<String> {
        explicit
            .or_else(|| self.inner.config.target_id.clone())
            .or_else(|| self.inner.server_id.get().cloned())
    }

    /// Ping the target window; true if a server answers within the ack timeout.
    pub async fn is_connect(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        self.inner
            .dispatcher
            .ping(
                &self.inner.target,
                &self.inner.config.target_origin,
                self.target_id(None),
                self.inner.config.ack_timeout(),
            )
            .await
    }

    pub async fn send(&self, path: &str, body: impl Into<RequestBody>, opts: RequestOptions) -> Result<Reply, RequestError> {
        self.call(path, body.into(), opts).await
    }

    /// Send a file or blob; the server buffers it before the handler runs.
    pub async fn send_file(&self, path: &str, file: FilePayload, mut opts: RequestOptions) -> Result<Reply, RequestError> {
        opts.stream.auto_resolve = true;
        opts.stream.kind = Some(StreamKind::File);
        self.call(path, RequestBody::from(file), opts).await
    }

    /// Send a live stream; the handler reads it as it arrives.
    pub async fn send_stream(&self, path: &str, source: StreamSource, opts: RequestOptions) -> Result<Reply, RequestError> {
        self.call(path, RequestBody::Stream(source), opts).await
    }

    async fn call(&self, path: &str, body: RequestBody, opts: RequestOptions) -> Result<Reply, RequestError> {
        let return_data = opts.return_data.unwrap_or(self.inner.config.return_data);
        let started = Instant::now();

        let outcome = self.exchange(path, body, opts).await;
        let chain = self
            .inner
            .response_interceptors
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        let outcome = run_response_chain(&chain, outcome).await;

        self.inner
            .dispatcher
            .observer()
            .on_settled(path, outcome.as_ref().err().map(|e| &e.code), started.elapsed());

        outcome.map(|res| if return_data { Reply::Data(res.body) } else { Reply::Full(res) })
    }

    async fn exchange(&self, path: &str, body: RequestBody, opts: RequestOptions) -> Result<Response, RequestError> {
        if self.is_destroyed() {
            return Err(RequestError::new(ErrorCode::ClientDestroyed, "client destroyed"));
        }
        let cfg = &self.inner.config;
        let request_id = ids::request_id();

        let mut headers: Headers = lower_keys(&cfg.headers).collect();
        headers.extend(lower_keys(&opts.headers));
        let mut cookies = self.jar().matching(path);
        cookies.extend(opts.cookies.clone());

        let chain = self
            .inner
            .request_interceptors
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        let req = run_request_chain(
            &chain,
            interceptor::OutgoingRequest {
                path: path.to_string(),
                body,
                headers,
                cookies,
            },
        )
        .await
        .map_err(|e| e.with_request_id(request_id.clone()))?;

        let require_ack = opts.require_ack.unwrap_or(cfg.require_ack);
        let target_id = self.target_id(opts.target_id.clone());
        let ack_token = require_ack.then(|| ids::instance_id("ack"));

        let mut env = Envelope::new(MessageType::Request, request_id.clone()).with_path(req.path.clone());
        env.require_ack = Some(require_ack);
        env.ack_token = ack_token.clone();
        env.target_id = target_id.clone();
        if !req.headers.is_empty() {
            env.headers = Some(req.headers);
        }
        if !req.cookies.is_empty() {
            env.cookies = Some(req.cookies);
        }

        let mut writer = match req.body {
            RequestBody::Plain(Value::Null) => None,
            RequestBody::Plain(v) => {
                env.body = Some(v);
                None
            }
            RequestBody::File(f) | RequestBody::Blob(f) => {
                let mut stream_opts = opts.stream.clone();
                stream_opts.auto_resolve = true;
                stream_opts.kind = Some(StreamKind::File);
                Some(self.writer(&request_id, target_id.clone(), StreamSource::File(f), stream_opts))
            }
            RequestBody::Stream(s) => Some(self.writer(&request_id, target_id.clone(), s, opts.stream.clone())),
        };

        let rx = self.inner.pending.register(&request_id);

        // The body stream is announced before the request so the server's
        // stream-start waiter is already satisfied when the request lands.
        if let Some(w) = writer.as_mut() {
            env.stream_id = Some(w.stream_id().to_string());
            if let Err(e) = w.open() {
                self.inner.pending.unregister(&request_id);
                return Err(e);
            }
        }
        if let Err(e) = self.inner.dispatcher.send(&self.inner.target, env, &cfg.target_origin) {
            self.inner.pending.unregister(&request_id);
            if let Some(w) = writer.as_ref() {
                w.fail("request not delivered");
            }
            return Err(RequestError::from(e).with_request_id(request_id));
        }
        if let Some(w) = writer {
            tokio::spawn(async move {
                if let Err(e) = w.pump().await {
                    tracing::debug!(code = %e.code, error = %e.message, "request body stream aborted");
                }
            });
        }

        let timeouts = Timeouts {
            ack: opts.ack_timeout.unwrap_or_else(|| cfg.ack_timeout()),
            request: opts.timeout.unwrap_or_else(|| cfg.timeout()),
            async_result: opts.async_timeout.unwrap_or_else(|| cfg.async_timeout()),
        };
        let machine = RequestMachine::new(timeouts, ack_token);
        let res = self.drive(&request_id, path, machine, require_ack, rx).await;
        self.inner.pending.unregister(&request_id);
        res
    }

    fn writer(&self, request_id: &str, target_id: Option<String>, source: StreamSource, opts: StreamOptions) -> StreamWriter {
        StreamWriter::new(
            self.inner.dispatcher.clone(),
            StreamRoute {
                target: self.inner.target.clone(),
                origin: self.inner.config.target_origin.clone(),
                target_id,
                request_id: request_id.to_string(),
            },
            ids::stream_id(),
            source,
            StreamOptions {
                chunk_size: if opts.chunk_size == StreamOptions::default().chunk_size {
                    self.inner.config.chunk_size
                } else {
                    opts.chunk_size
                },
                ..opts
            },
        )
    }

    async fn drive(
        &self,
        request_id: &str,
        path: &str,
        mut machine: RequestMachine,
        require_ack: bool,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
    ) -> Result<Response, RequestError> {
        let first = machine.start(require_ack);
        let sleep = tokio::time::sleep(first);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else {
                        return Err(RequestError::new(ErrorCode::ClientDestroyed, "client destroyed")
                            .with_request_id(request_id));
                    };
                    match inbound {
                        Inbound::Ack(env) => {
                            if let Transition::Rearm(d) = machine.on_ack(env.ack_token.as_deref()) {
                                if let Some(id) = env.creator_id {
                                    let _ = self.inner.server_id.set(id);
                                }
                                sleep.as_mut().reset(Instant::now() + d);
                            }
                        }
                        Inbound::Async => {
                            if let Transition::Rearm(d) = machine.on_async() {
                                sleep.as_mut().reset(Instant::now() + d);
                            }
                        }
                        Inbound::Result(env) => {
                            if machine.on_result() == Transition::Settle {
                                return self.settle_result(env, path);
                            }
                        }
                        Inbound::Stream(opened) => {
                            if machine.on_stream_start() == Transition::OpenStream {
                                let res = self.settle_stream(opened, path).await;
                                machine.settle();
                                return res;
                            }
                            if let Some(id) = opened.start.stream_id.as_deref() {
                                self.inner.dispatcher.unregister_stream(id);
                            }
                        }
                    }
                }
                _ = &mut sleep => {
                    let code = machine.on_timeout().unwrap_or(ErrorCode::Timeout);
                    tracing::debug!(request_id, path, code = %code, "request timed out");
                    return Err(RequestError::new(code.clone(), format!("{code} waiting on {path}"))
                        .with_request_id(request_id));
                }
            }
        }
    }

    fn absorb_cookies(&self, headers: &Headers) {
        if let Some(h) = headers.get(SET_COOKIE) {
            self.jar().apply_set_cookie(h);
        }
    }

    fn settle_result(&self, env: Envelope, path: &str) -> Result<Response, RequestError> {
        let status = env.status.unwrap_or(if env.kind == MessageType::Error { 500 } else { 200 });
        let headers = env.headers.unwrap_or_default();
        self.absorb_cookies(&headers);

        if env.kind == MessageType::Error {
            let (code, message) = match env.error {
                Some(e) => (ErrorCode::from_wire(&e.code), e.message),
                None => (ErrorCode::RequestError, "request failed".to_string()),
            };
            return Err(RequestError::new(code, message)
                .with_request_id(env.request_id)
                .with_response(ErrorResponse {
                    status,
                    status_text: env.status_text,
                    data: env.data,
                }));
        }

        Ok(Response {
            request_id: env.request_id,
            path: env.path.unwrap_or_else(|| path.to_string()),
            status,
            status_text: env.status_text.unwrap_or_else(|| status_text(status).to_string()),
            headers,
            body: ResponseBody::Data(env.data.or(env.body).unwrap_or(Value::Null)),
            responder: env.creator_id,
        })
    }

    async fn settle_stream(&self, opened: OpenedStream, path: &str) -> Result<Response, RequestError> {
        let request_id = opened.start.request_id.clone();
        let responder = opened.start.creator_id.clone();
        let status = opened.start.status.unwrap_or(200);
        let status_text_v = opened.start.status_text.clone();
        let headers = opened.start.headers.clone().unwrap_or_default();
        self.absorb_cookies(&headers);

        let reader = BodyStream::new(self.inner.dispatcher.clone(), opened, self.inner.config.stream_timing())?;
        let body = if reader.kind() == StreamKind::File && reader.auto_resolve() {
            ResponseBody::File(reader.into_file().await?)
        } else {
            ResponseBody::Stream(reader)
        };

        Ok(Response {
            request_id,
            path: path.to_string(),
            status,
            status_text: status_text_v.unwrap_or_else(|| status_text(status).to_string()),
            headers,
            body,
            responder,
        })
    }
}
