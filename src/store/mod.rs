//! Store backends and the tiered adapter built on top of them.
//!
//! - [`MemoryStore`]: in-process `DashMap` double, used by the test suite
//!   and by single-node deployments without a shared store.
//! - [`RedisStore`]: the production shared-store backend (feature `redis`).
//! - [`L1Cache`]: the in-process hot tier (moka).
//! - [`TieredStore`]: the adapter every cache operation flows through,
//!   combining L1 and remote with envelope compression and circuit breaking.

mod l1;
mod memory_store;
mod tiered;

#[cfg(feature = "redis")]
mod redis_store;

pub use l1::{L1Cache, L1Stats};
pub use memory_store::MemoryStore;
pub use tiered::{KeyScan, StoreStats, TieredStore};

#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
