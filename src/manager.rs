//! Cache manager: namespaced, TTL-defaulted operations over the tiered store.
//!
//! The manager is stateless beyond configuration and counters. It turns
//! `(namespace, principal, logical key)` into a derived store key, applies
//! the per-namespace TTL table, routes bytes through the codec, and maps
//! store failures according to the fail-open/fail-quiet policy: reads
//! degrade to misses, writes degrade to warnings, and only the counters
//! remember it happened.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::codec::JsonCodec;
use crate::error::{BackboneError, Result};
use crate::keys::{Namespace, Principal, derive_key};
use crate::store::{StoreStats, TieredStore};
use crate::traits::Codec;

/// Options for a cache write.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Explicit TTL; falls back to the namespace default.
    pub ttl: Option<Duration>,
    /// Key version, appended as a `:v{n}` suffix.
    pub version: Option<u32>,
}

/// Options for a cache read.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub version: Option<u32>,
}

#[derive(Default)]
struct ManagerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    response_time_micros: AtomicU64,
    timed_ops: AtomicU64,
}

/// Snapshot of manager counters plus the underlying store split.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// `hits / (hits + misses)`, 0.0 when idle.
    pub hit_rate: f64,
    /// Rolling average time per timed operation, in microseconds.
    pub avg_response_micros: f64,
    pub store: StoreStats,
}

struct ManagerInner<C: Codec> {
    store: Arc<TieredStore>,
    codec: C,
    counters: ManagerCounters,
}

/// Namespaced cache operations. Cheap to clone.
pub struct CacheManager<C: Codec = JsonCodec> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: Codec> Clone for CacheManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CacheManager<JsonCodec> {
    #[must_use]
    pub fn new(store: Arc<TieredStore>) -> Self {
        Self::with_codec(store, JsonCodec)
    }
}

impl<C: Codec> CacheManager<C> {
    #[must_use]
    pub fn with_codec(store: Arc<TieredStore>, codec: C) -> Self {
        debug!(codec = codec.name(), "cache manager initialized");
        Self {
            inner: Arc::new(ManagerInner {
                store,
                codec,
                counters: ManagerCounters::default(),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TieredStore> {
        &self.inner.store
    }

    fn key(
        &self,
        namespace: Namespace,
        principal: &Principal,
        logical: &str,
        version: Option<u32>,
    ) -> String {
        let cfg = self.inner.store.config();
        derive_key(
            cfg.env_prefix.as_deref(),
            &cfg.app_prefix,
            namespace,
            principal,
            logical,
            version,
        )
    }

    /// Cache a value. Store outages degrade to a warning; only codec
    /// failures surface, and the value is simply not cached.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        principal: &Principal,
        logical: &str,
        value: &T,
        opts: SetOptions,
    ) -> Result<()> {
        let started = Instant::now();
        let bytes = match self.inner.codec.serialize(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(namespace = %namespace, key = %logical, error = %err, "skipping cache write: serialization failed");
                return Ok(());
            }
        };

        let ttl = opts.ttl.unwrap_or_else(|| namespace.default_ttl());
        let key = self.key(namespace, principal, logical, opts.version);

        match self.inner.store.set(&key, &bytes, ttl).await {
            Ok(()) => {
                self.inner.counters.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(BackboneError::StoreUnavailable(reason)) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, reason = %reason, "cache write dropped: store unavailable");
            }
            Err(err) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "cache write dropped");
            }
        }
        self.observe(started);
        Ok(())
    }

    /// Read a value. Any store or codec failure reads as a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        principal: &Principal,
        logical: &str,
        opts: GetOptions,
    ) -> Result<Option<T>> {
        let started = Instant::now();
        let key = self.key(namespace, principal, logical, opts.version);

        let bytes = match self.inner.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "cache read degraded to miss");
                self.observe(started);
                return Ok(None);
            }
        };

        let result = match bytes {
            Some(bytes) => match self.inner.codec.deserialize::<T>(&bytes) {
                Ok(value) => {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    Some(value)
                }
                Err(err) => {
                    // Stale or foreign payload: evict and read as a miss.
                    self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %err, "evicting undeserializable entry");
                    let _ = self.inner.store.del(&[key]).await;
                    None
                }
            },
            None => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        self.observe(started);
        Ok(result)
    }

    /// Batched read: one remote roundtrip for everything missing in L1.
    /// Order-preserving; failures degrade to misses.
    pub async fn get_multiple<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        principal: &Principal,
        logicals: &[&str],
        opts: GetOptions,
    ) -> Result<Vec<Option<T>>> {
        let started = Instant::now();
        let keys: Vec<String> = logicals
            .iter()
            .map(|logical| self.key(namespace, principal, logical, opts.version))
            .collect();

        let fetched = match self.inner.store.mget(&keys).await {
            Ok(fetched) => fetched,
            Err(err) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .counters
                    .misses
                    .fetch_add(keys.len() as u64, Ordering::Relaxed);
                warn!(error = %err, "batched read degraded to misses");
                self.observe(started);
                let mut out: Vec<Option<T>> = Vec::with_capacity(logicals.len());
                out.resize_with(logicals.len(), || None);
                return Ok(out);
            }
        };

        let mut out = Vec::with_capacity(fetched.len());
        for bytes in fetched {
            match bytes {
                Some(bytes) => match self.inner.codec.deserialize::<T>(&bytes) {
                    Ok(value) => {
                        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                        out.push(Some(value));
                    }
                    Err(_) => {
                        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                        out.push(None);
                    }
                },
                None => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    out.push(None);
                }
            }
        }

        self.observe(started);
        Ok(out)
    }

    /// Delete one exact key for one principal.
    pub async fn delete(
        &self,
        namespace: Namespace,
        principal: &Principal,
        logical: &str,
    ) -> Result<usize> {
        let key = self.key(namespace, principal, logical, None);
        match self.inner.store.del(&[key]).await {
            Ok(count) => {
                self.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "cache delete dropped: store unavailable");
                Ok(0)
            }
        }
    }

    /// Delete several exact keys for one principal in one roundtrip.
    pub async fn delete_many(
        &self,
        namespace: Namespace,
        principal: &Principal,
        logicals: &[&str],
    ) -> Result<usize> {
        let keys: Vec<String> = logicals
            .iter()
            .map(|logical| self.key(namespace, principal, logical, None))
            .collect();
        match self.inner.store.del(&keys).await {
            Ok(count) => {
                self.inner
                    .counters
                    .deletes
                    .fetch_add(keys.len() as u64, Ordering::Relaxed);
                Ok(count)
            }
            Err(err) => {
                self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "bulk cache delete dropped: store unavailable");
                Ok(0)
            }
        }
    }

    /// Delete every key in `namespace` whose principal-and-tail segment
    /// matches `pattern` (glob `*`). Uses cursor-based scanning under the
    /// namespace prefix only, deleting in bounded batches.
    pub async fn invalidate_pattern(&self, namespace: Namespace, pattern: &str) -> Result<usize> {
        let cfg = self.inner.store.config();
        let mut full = String::new();
        if let Some(env) = cfg.env_prefix.as_deref() {
            full.push_str(env);
            full.push(':');
        }
        full.push_str(&cfg.app_prefix);
        full.push(':');
        full.push_str(namespace.prefix());
        full.push_str(":*:");
        full.push_str(pattern);

        let mut scan = self.inner.store.scan(&full);
        let mut removed = 0usize;
        let batch_size = cfg.scan_page_size;
        let mut batch: Vec<String> = Vec::with_capacity(batch_size);

        loop {
            let page = match scan.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => {
                    self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(pattern = %full, error = %err, "pattern invalidation aborted: store unavailable");
                    return Err(err);
                }
            };
            for key in page {
                batch.push(key);
                if batch.len() >= batch_size {
                    removed += self.delete_batch(&mut batch).await?;
                }
            }
        }
        if !batch.is_empty() {
            removed += self.delete_batch(&mut batch).await?;
        }

        if removed > 0 {
            debug!(pattern = %full, removed, "pattern invalidated");
        }
        Ok(removed)
    }

    async fn delete_batch(&self, batch: &mut Vec<String>) -> Result<usize> {
        let keys = std::mem::take(batch);
        let count = self.inner.store.del(&keys).await?;
        self.inner
            .counters
            .deletes
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(count)
    }

    fn observe(&self, started: Instant) {
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.inner
            .counters
            .response_time_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.inner.counters.timed_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ManagerStats {
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let timed = c.timed_ops.load(Ordering::Relaxed);
        ManagerStats {
            hits,
            misses,
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            hit_rate: if hits + misses > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    hits as f64 / (hits + misses) as f64
                }
            } else {
                0.0
            },
            avg_response_micros: if timed > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    c.response_time_micros.load(Ordering::Relaxed) as f64 / timed as f64
                }
            } else {
                0.0
            },
            store: self.inner.store.stats(),
        }
    }
}
