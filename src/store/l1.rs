//! L1 hot tier: in-process moka cache with per-key TTL.
//!
//! Size-bounded with least-recently-used eviction; entries additionally
//! carry their own expiry and are lazily dropped on read.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::future::Cache;
use tracing::debug;

#[derive(Debug, Clone)]
struct L1Entry {
    value: Bytes,
    expires_at: Instant,
}

impl L1Entry {
    fn new(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// In-process hot tier.
pub struct L1Cache {
    cache: Cache<String, L1Entry>,
    max_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl L1Cache {
    #[must_use]
    pub fn new(max_capacity: u64, max_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            // Safety net over the per-entry expiry below.
            .time_to_live(max_ttl.max(Duration::from_secs(1)))
            .build();

        debug!(capacity = max_capacity, "L1 tier initialized");
        Self {
            cache,
            max_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Some(entry) if entry.is_expired() => {
                let _ = self.cache.remove(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert with the given TTL, clamped to the tier ceiling.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let clamped = ttl.min(self.max_ttl);
        self.cache
            .insert(key.to_string(), L1Entry::new(value, clamped))
            .await;
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn remove(&self, key: &str) {
        let _ = self.cache.remove(key).await;
    }

    pub fn stats(&self) -> L1Stats {
        L1Stats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
        }
    }
}

/// Snapshot of L1 counters.
#[derive(Debug, Clone)]
pub struct L1Stats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub entries: u64,
}
