//! Observer hooks for protocol traffic.

use std::sync::Arc;
use std::time::Duration;

use postrpc_core::error::ErrorCode;
use postrpc_core::protocol::Envelope;

use crate::context::MessageContext;

/// Why an admitted envelope was not handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// `targetId` names another instance.
    WrongTarget,
    /// Origin failed the allowlist / validator.
    OriginRejected,
    /// Version below the supported minimum.
    UnsupportedVersion,
    /// No handler for this type, or no waiter for this id.
    Unhandled,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::WrongTarget => "wrong_target",
            DropReason::OriginRejected => "origin_rejected",
            DropReason::UnsupportedVersion => "unsupported_version",
            DropReason::Unhandled => "unhandled",
        }
    }
}

/// Debug hooks injected at construction.
pub trait Observer: Send + Sync {
    fn on_inbound(&self, _env: &Envelope, _ctx: &MessageContext) {}
    fn on_outbound(&self, _env: &Envelope) {}
    fn on_dropped(&self, _env: &Envelope, _reason: DropReason) {}
    /// A client request settled; `None` means success.
    fn on_settled(&self, _path: &str, _error: Option<&ErrorCode>, _elapsed: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

pub fn noop() -> Arc<dyn Observer> {
    Arc::new(NoopObserver)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_inbound(&self, env: &Envelope, ctx: &MessageContext) {
        tracing::trace!(kind = env.kind.as_str(), request_id = %env.request_id, origin = ctx.origin(), "inbound");
    }

    fn on_outbound(&self, env: &Envelope) {
        tracing::trace!(kind = env.kind.as_str(), request_id = %env.request_id, "outbound");
    }

    fn on_dropped(&self, env: &Envelope, reason: DropReason) {
        tracing::debug!(kind = env.kind.as_str(), request_id = %env.request_id, reason = reason.as_str(), "dropped");
    }

    fn on_settled(&self, path: &str, error: Option<&ErrorCode>, elapsed: Duration) {
        match error {
            None => tracing::debug!(path, elapsed_ms = elapsed.as_millis() as u64, "request settled"),
            Some(code) => tracing::debug!(path, code = code.as_str(), elapsed_ms = elapsed.as_millis() as u64, "request failed"),
        }
    }
}
