//! Observability hooks.
//!
//! Instances take an `Arc<dyn Observer>` at construction; the default is a
//! no-op. `TracingObserver` logs every envelope at trace level and
//! `EngineMetrics` counts them for a Prometheus text endpoint.

pub mod metrics;
pub mod observer;

pub use metrics::EngineMetrics;
pub use observer::{noop, DropReason, NoopObserver, Observer, TracingObserver};
