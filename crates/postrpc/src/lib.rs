//! Top-level facade crate for postrpc.
//!
//! Re-exports the wire contracts and the engine so users can depend on a single crate.

pub mod core {
    pub use postrpc_core::*;
}

pub mod engine {
    pub use postrpc_engine::*;
}
