//! Policy layer (origin allowlist, per-peer admission control).
//!
//! Both checks are cheap and synchronous so they can run inside the channel
//! fan-out before any work is spawned.

pub mod limiter;
pub mod origin;

pub use limiter::{ConcurrencyLimiter, Ticket};
pub use origin::{OriginPolicy, OriginRule};
