//! Capability traits at the backbone's seams.
//!
//! `RemoteStore` is the typed facade over the shared store. The production
//! implementation is Redis; the in-process [`MemoryStore`] double implements
//! the same trait so every layer above it can be exercised without external
//! services.
//!
//! [`MemoryStore`]: crate::store::MemoryStore

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Shared-store capability set: `get`/`set`/`mget`/`del`/`scan`/`info`/`ping`.
///
/// All values are opaque envelope bytes; compression and codec concerns live
/// above this trait. Errors surface as
/// [`StoreUnavailable`](crate::error::BackboneError::StoreUnavailable) and
/// are handled fail-open by the cache manager.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get a value. Expired entries are never returned.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Get a value together with its remaining TTL (`None` = no expiry).
    /// Used to repopulate the L1 tier with a clamped TTL.
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>>;

    /// Set a value with a TTL. The last successful write for a key wins.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Order-preserving multi-get in a single roundtrip.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Delete keys; returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize>;

    /// One page of a cursor-based scan. Pass cursor `0` to start; a returned
    /// cursor of `0` means the iteration is complete. Implementations must
    /// not block the store (no full-keyspace enumeration).
    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>)>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Backend-reported diagnostics, free-form.
    async fn info(&self) -> Result<String>;

    /// Backend name, for logging.
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Pluggable value serialization, mirroring the store-agnostic design of the
/// rest of the crate. The default is [`JsonCodec`](crate::codec::JsonCodec).
pub trait Codec: Send + Sync + Debug {
    /// Serialize a value to bytes.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes into a value.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Codec name, for logging.
    fn name(&self) -> &'static str;
}
