//! In-process store double backed by `DashMap`.
//!
//! Implements the full [`RemoteStore`] capability set with lazy TTL expiry
//! and deterministic cursor pagination, so everything above the store trait
//! can be exercised without a running Redis. An `offline` switch simulates a
//! shared-store outage for fail-open tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{BackboneError, Result};
use crate::traits::RemoteStore;

#[derive(Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }

    fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// In-memory `RemoteStore` implementation.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    offline: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a shared-store outage; every operation fails with
    /// `StoreUnavailable` until switched back on.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BackboneError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn sorted_matches(&self, pattern: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Minimal glob matcher supporting `*` wildcards, the subset the key
/// patterns in this crate use.
fn glob_match(pattern: &str, key: &str) -> bool {
    let mut segments = pattern.split('*');
    let Some(first) = segments.next() else {
        return key.is_empty();
    };
    if !key.starts_with(first) {
        return false;
    }
    let mut rest = key.get(first.len()..).unwrap_or("");
    let mut last_segment: Option<&str> = None;
    for segment in segments {
        if let Some(prev) = last_segment.take() {
            match rest.find(prev) {
                Some(pos) => rest = rest.get(pos + prev.len()..).unwrap_or(""),
                None => return false,
            }
        }
        last_segment = Some(segment);
    }
    match last_segment {
        // Pattern had no '*' at all: must match exactly.
        None => rest.is_empty(),
        Some("") => true,
        Some(tail) => rest.ends_with(tail),
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        match self.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.bytes.clone())),
            None => Ok(None),
        }
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(Vec<u8>, Option<Duration>)>> {
        self.check_online()?;
        match self.entries.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                self.entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some((entry.bytes.clone(), entry.remaining_ttl()))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_online()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_online()?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        self.check_online()?;
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.check_online()?;
        let matches = self.sorted_matches(pattern);
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(matches.len());
        let end = start.saturating_add(count.max(1)).min(matches.len());
        let page = matches.get(start..end).unwrap_or(&[]).to_vec();
        let next = if end >= matches.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn info(&self) -> Result<String> {
        self.check_online()?;
        Ok(format!("memory_store entries={}", self.entries.len()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefix_and_infix() {
        assert!(glob_match("mlg:api:voting:*", "mlg:api:voting:anonymous:results/C42"));
        assert!(glob_match("*:results/*", "mlg:api:voting:anonymous:results/C42"));
        assert!(!glob_match("mlg:api:clan:*", "mlg:api:voting:anonymous:results/C42"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact-not"));
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let store = MemoryStore::new();
        store.set("k", b"v", Duration::from_millis(20)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_pages_are_disjoint_and_complete() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set(&format!("scan:{i:02}"), b"v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let (next, page) = store.scan_page("scan:*", cursor, 10).await.unwrap();
            seen.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        assert_eq!(seen.len(), 25);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 25);
    }

    #[tokio::test]
    async fn offline_store_errors_every_operation() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.get("k").await,
            Err(BackboneError::StoreUnavailable(_))
        ));
        assert!(store.ping().await.is_err());
    }
}
