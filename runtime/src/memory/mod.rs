//! Pre-allocated memory: fixed-size pools and per-event bump arenas

pub mod arena;
pub mod pools;

pub use arena::Arena;
pub use pools::{FixedPool, LockFreePool, PoolGuard};
