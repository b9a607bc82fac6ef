//! Per-message context shared by every receiver of one inbound event.
//!
//! Co-located instances on the same isolation channel coordinate through the
//! claim recorded here instead of a lock.

pub mod message;

pub use message::{Claim, MessageContext};
