//! Dispatcher module exports.
//!
//! Re-exports the dispatcher and the handler contract so client and server
//! engines can depend on this module directly.

pub mod dispatcher;

pub use dispatcher::{Disposition, MessageDispatcher, MessageHandler, VersionErrorHook, WeakDispatcher};
