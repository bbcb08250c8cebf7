//! Tiered store adapter: L1 hot tier + remote shared store.
//!
//! Every cache read and write in the backbone flows through this adapter.
//! It owns envelope compression (transparent, flagged by the leading byte),
//! the L1 admission rules, and the circuit breaker that short-circuits
//! remote calls during a sustained outage.
//!
//! Envelope layout: `[flag][payload]` where flag `0x00` means raw and
//! `0x01` means gzip.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::compress::{gunzip, gzip};
use crate::config::StoreConfig;
use crate::error::{BackboneError, Result};
use crate::store::l1::{L1Cache, L1Stats};
use crate::traits::RemoteStore;

const FLAG_RAW: u8 = 0x00;
const FLAG_GZIP: u8 = 0x01;

/// Trips after sustained remote failure and short-circuits calls for a
/// cool-down, then lets a probe through.
struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    failures: AtomicU32,
    open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            failures: AtomicU32::new(0),
            open_until: Mutex::new(None),
        }
    }

    fn allow(&self) -> bool {
        let mut open_until = self.open_until.lock();
        match *open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // Cool-down elapsed: let one probe through half-open.
                *open_until = None;
                true
            }
            None => true,
        }
    }

    fn on_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            *self.open_until.lock() = Some(Instant::now() + self.cooldown);
            warn!(failures, cooldown_secs = self.cooldown.as_secs(), "store circuit opened");
        }
    }
}

/// Counters for the tiered adapter.
#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    compressed_writes: AtomicU64,
    compression_saved_bytes: AtomicU64,
}

/// Snapshot of the adapter's counters.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub l1_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    pub compressed_writes: u64,
    pub compression_saved_bytes: u64,
    pub l1: L1Stats,
}

/// The C1 adapter: typed operations over L1 + remote with TTLs.
pub struct TieredStore {
    remote: Arc<dyn RemoteStore>,
    l1: L1Cache,
    cfg: StoreConfig,
    breaker: CircuitBreaker,
    counters: Counters,
}

impl TieredStore {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteStore>, cfg: StoreConfig) -> Self {
        let l1 = L1Cache::new(cfg.l1_max_capacity, cfg.l1_max_ttl);
        let breaker = CircuitBreaker::new(cfg.breaker_failure_threshold, cfg.breaker_cooldown);
        Self {
            remote,
            l1,
            cfg,
            breaker,
            counters: Counters::default(),
        }
    }

    /// Get the decoded payload for `key`, checking L1 first.
    ///
    /// On a remote hit the payload is repopulated into L1 with the remaining
    /// TTL clamped to the tier ceiling. A corrupt envelope evicts the entry
    /// and reads as a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(hit) = self.l1.get(key).await {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(hit.to_vec()));
        }

        let fetched = self
            .remote_call(self.remote.get_with_ttl(key))
            .await?;

        let Some((envelope, remaining_ttl)) = fetched else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let (payload, was_compressed) = match self.decode(key, &envelope) {
            Ok(decoded) => decoded,
            Err(err) => {
                // Evict the corrupt entry; next read repopulates.
                let _ = self.remote_call(self.remote.del(&[key.to_string()])).await;
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "evicted undecodable entry");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);

        if !was_compressed && payload.len() <= self.cfg.l1_max_entry_bytes {
            let ttl = remaining_ttl.unwrap_or(self.cfg.default_ttl);
            self.l1.set(key, Bytes::from(payload.clone()), ttl).await;
        }

        Ok(Some(payload))
    }

    /// Write `payload` under `key` with `ttl`.
    ///
    /// The payload is wrapped in the compression envelope; L1 is populated
    /// only for uncompressed payloads under the admission size.
    pub async fn set(&self, key: &str, payload: &[u8], ttl: Duration) -> Result<()> {
        let (envelope, compressed) = self.encode(payload)?;
        self.remote_call(self.remote.set(key, &envelope, ttl)).await?;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);

        if compressed {
            self.counters.compressed_writes.fetch_add(1, Ordering::Relaxed);
            let saved = payload.len().saturating_sub(envelope.len().saturating_sub(1));
            self.counters
                .compression_saved_bytes
                .fetch_add(saved as u64, Ordering::Relaxed);
        } else if payload.len() <= self.cfg.l1_max_entry_bytes {
            self.l1.set(key, Bytes::copy_from_slice(payload), ttl).await;
        }

        debug!(key = %key, ttl_secs = ttl.as_secs(), compressed, "tiered set");
        Ok(())
    }

    /// Order-preserving multi-get: L1 hits are answered locally, the rest go
    /// to the remote store in one roundtrip and eligible hits refill L1.
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out: Vec<Option<Vec<u8>>> = vec![None; keys.len()];
        let mut remote_keys = Vec::new();
        let mut remote_slots = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            if let Some(hit) = self.l1.get(key).await {
                self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                if let Some(slot) = out.get_mut(i) {
                    *slot = Some(hit.to_vec());
                }
            } else {
                remote_keys.push(key.clone());
                remote_slots.push(i);
            }
        }

        if remote_keys.is_empty() {
            return Ok(out);
        }

        let fetched = self.remote_call(self.remote.mget(&remote_keys)).await?;
        for ((slot, key), value) in remote_slots.iter().zip(&remote_keys).zip(fetched) {
            let Some(envelope) = value else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            match self.decode(key, &envelope) {
                Ok((payload, was_compressed)) => {
                    self.counters.remote_hits.fetch_add(1, Ordering::Relaxed);
                    if !was_compressed && payload.len() <= self.cfg.l1_max_entry_bytes {
                        self.l1
                            .set(key, Bytes::from(payload.clone()), self.cfg.l1_max_ttl)
                            .await;
                    }
                    if let Some(out_slot) = out.get_mut(*slot) {
                        *out_slot = Some(payload);
                    }
                }
                Err(err) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %err, "skipping undecodable entry in mget");
                }
            }
        }

        Ok(out)
    }

    /// Delete keys from both tiers; returns the remote delete count.
    pub async fn del(&self, keys: &[String]) -> Result<usize> {
        for key in keys {
            self.l1.remove(key).await;
        }
        let count = self.remote_call(self.remote.del(keys)).await?;
        self.counters.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Start a lazy, finite key scan for `pattern`. The scan is
    /// cursor-based and not restartable; callers drain pages until `None`.
    #[must_use]
    pub fn scan(&self, pattern: &str) -> KeyScan<'_> {
        KeyScan {
            store: self,
            pattern: pattern.to_string(),
            cursor: 0,
            done: false,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.remote_call(self.remote.ping()).await
    }

    pub async fn info(&self) -> Result<String> {
        self.remote_call(self.remote.info()).await
    }

    /// Round-trip self check: remote ping plus an L1 write/read.
    pub async fn health_check(&self) -> bool {
        let l1_ok = {
            let key = "health:l1";
            self.l1
                .set(key, Bytes::from_static(b"ok"), Duration::from_secs(5))
                .await;
            self.l1.get(key).await.is_some()
        };
        let remote_ok = self.ping().await.is_ok();
        if !remote_ok {
            warn!("health check: shared store unreachable (serving degraded)");
        }
        l1_ok
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            remote_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            compressed_writes: self.counters.compressed_writes.load(Ordering::Relaxed),
            compression_saved_bytes: self
                .counters
                .compression_saved_bytes
                .load(Ordering::Relaxed),
            l1: self.l1.stats(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    async fn remote_call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        if !self.breaker.allow() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(BackboneError::StoreUnavailable("circuit open".to_string()));
        }
        match fut.await {
            Ok(value) => {
                self.breaker.on_success();
                Ok(value)
            }
            Err(err) => {
                self.breaker.on_failure();
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn encode(&self, payload: &[u8]) -> Result<(Vec<u8>, bool)> {
        if payload.len() > self.cfg.compression_threshold {
            if let Ok(packed) = gzip(payload, self.cfg.compression_level) {
                // Only keep the compressed form when it actually shrinks.
                if packed.len() < payload.len() {
                    let mut envelope = Vec::with_capacity(packed.len() + 1);
                    envelope.push(FLAG_GZIP);
                    envelope.extend_from_slice(&packed);
                    return Ok((envelope, true));
                }
            }
        }
        let mut envelope = Vec::with_capacity(payload.len() + 1);
        envelope.push(FLAG_RAW);
        envelope.extend_from_slice(payload);
        Ok((envelope, false))
    }

    fn decode(&self, key: &str, envelope: &[u8]) -> Result<(Vec<u8>, bool)> {
        match envelope.split_first() {
            Some((&FLAG_RAW, payload)) => Ok((payload.to_vec(), false)),
            Some((&FLAG_GZIP, payload)) => {
                let inflated =
                    gunzip(payload).map_err(|e| BackboneError::DecompressFailed {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                if inflated.is_empty() {
                    return Err(BackboneError::DecompressFailed {
                        key: key.to_string(),
                        reason: "compressed envelope inflated to empty payload".to_string(),
                    });
                }
                Ok((inflated, true))
            }
            _ => Err(BackboneError::DecompressFailed {
                key: key.to_string(),
                reason: "unknown envelope flag".to_string(),
            }),
        }
    }
}

/// Lazy page-by-page key scan over the remote store.
pub struct KeyScan<'a> {
    store: &'a TieredStore,
    pattern: String,
    cursor: u64,
    done: bool,
}

impl KeyScan<'_> {
    /// Fetch the next page of matching keys; `None` once exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let page_size = self.store.cfg.scan_page_size;
        let (next, keys) = self
            .store
            .remote_call(
                self.store
                    .remote
                    .scan_page(&self.pattern, self.cursor, page_size),
            )
            .await?;
        self.cursor = next;
        if next == 0 {
            self.done = true;
        }
        // SCAN may return empty pages mid-iteration; surface them so callers
        // keep draining until the cursor closes.
        Ok(Some(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tiered() -> (Arc<MemoryStore>, TieredStore) {
        let remote = Arc::new(MemoryStore::new());
        let store = TieredStore::new(remote.clone(), StoreConfig::default());
        (remote, store)
    }

    #[tokio::test]
    async fn small_values_skip_compression() {
        let (remote, store) = tiered();
        store.set("k", b"small", Duration::from_secs(60)).await.unwrap();
        let envelope = remote.get("k").await.unwrap().unwrap();
        assert_eq!(envelope.first(), Some(&FLAG_RAW));
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"small");
    }

    #[tokio::test]
    async fn large_values_are_compressed_transparently() {
        let (remote, store) = tiered();
        let payload = b"leaderboard-row,".repeat(512);
        store.set("k", &payload, Duration::from_secs(60)).await.unwrap();

        let envelope = remote.get("k").await.unwrap().unwrap();
        assert_eq!(envelope.first(), Some(&FLAG_GZIP));
        assert!(envelope.len() < payload.len());

        assert_eq!(store.get("k").await.unwrap().unwrap(), payload);
        assert!(store.stats().compression_saved_bytes > 0);
    }

    #[tokio::test]
    async fn incompressible_values_are_stored_raw() {
        let (remote, store) = tiered();
        let payload: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        store.set("k", &payload, Duration::from_secs(60)).await.unwrap();
        let envelope = remote.get("k").await.unwrap().unwrap();
        // Random bytes do not shrink under gzip, so the raw form is kept.
        assert_eq!(envelope.first(), Some(&FLAG_RAW));
    }

    #[tokio::test]
    async fn corrupt_envelope_reads_as_miss_and_evicts() {
        let (remote, store) = tiered();
        remote
            .set("k", &[FLAG_GZIP, 0xde, 0xad], Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(remote.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mget_preserves_order_and_absences() {
        let (_, store) = tiered();
        store.set("a", b"1", Duration::from_secs(60)).await.unwrap();
        store.set("c", b"3", Duration::from_secs(60)).await.unwrap();
        let got = store
            .mget(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn circuit_opens_after_sustained_failure() {
        let remote = Arc::new(MemoryStore::new());
        let mut cfg = StoreConfig::default();
        cfg.breaker_failure_threshold = 3;
        cfg.breaker_cooldown = Duration::from_secs(60);
        let store = TieredStore::new(remote.clone(), cfg);

        remote.set_offline(true);
        for _ in 0..3 {
            assert!(store.get("k").await.is_err());
        }
        // Circuit is now open: calls short-circuit without reaching the store.
        remote.set_offline(false);
        assert!(matches!(
            store.get("k").await,
            Err(BackboneError::StoreUnavailable(_))
        ));
    }
}
