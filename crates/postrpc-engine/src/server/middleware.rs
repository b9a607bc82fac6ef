//! Handler and middleware contracts, and the chain that links them.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use postrpc_core::error::{ErrorCode, RequestError, RpcError};

use super::request::ServerRequest;
use super::response::ServerResponse;

/// Failure raised by a handler or middleware.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub status: Option<u16>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::RequestError,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = code;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<RequestError> for HandlerError {
    fn from(e: RequestError) -> Self {
        Self {
            status: e.status(),
            code: e.code,
            message: e.message,
        }
    }
}

impl From<RpcError> for HandlerError {
    fn from(e: RpcError) -> Self {
        Self::new(e.to_string()).with_code(e.code())
    }
}

/// `Ok(Some(v))` is sent as the response unless `res` already sent one;
/// `Ok(None)` means the handler answered through `res` (or forgot to).
pub type HandlerResult = Result<Option<Value>, HandlerError>;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: ServerRequest, res: ServerResponse) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(ServerRequest, ServerResponse) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, req: ServerRequest, res: ServerResponse) -> HandlerResult {
        (self)(req, res).await
    }
}

/// Adapter for handlers that never suspend.
pub struct SyncHandler<F>(F);

pub fn sync_handler<F>(f: F) -> SyncHandler<F>
where
    F: Fn(&ServerRequest, &ServerResponse) -> HandlerResult + Send + Sync,
{
    SyncHandler(f)
}

#[async_trait]
impl<F> Handler for SyncHandler<F>
where
    F: Fn(&ServerRequest, &ServerResponse) -> HandlerResult + Send + Sync,
{
    async fn call(&self, req: ServerRequest, res: ServerResponse) -> HandlerResult {
        (self.0)(&req, &res)
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Call `next.run(req, res)` to continue, or answer through `res`.
    async fn handle(&self, req: ServerRequest, res: ServerResponse, next: Next) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(ServerRequest, ServerResponse, Next) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, req: ServerRequest, res: ServerResponse, next: Next) -> HandlerResult {
        (self)(req, res, next).await
    }
}

/// Remaining part of the chain, ending with the route handler.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    pub(crate) fn new(chain: Vec<Arc<dyn Middleware>>, handler: Arc<dyn Handler>) -> Self {
        Self {
            chain: chain.into(),
            index: 0,
            handler,
        }
    }

    pub fn run(self, req: ServerRequest, res: ServerResponse) -> BoxFuture<'static, HandlerResult> {
        Box::pin(async move {
            match self.chain.get(self.index).cloned() {
                Some(mw) => {
                    let next = Next {
                        chain: Arc::clone(&self.chain),
                        index: self.index + 1,
                        handler: Arc::clone(&self.handler),
                    };
                    mw.handle(req, res, next).await
                }
                None => self.handler.call(req, res).await,
            }
        })
    }
}
