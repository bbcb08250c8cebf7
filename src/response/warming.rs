//! Cache warming: a bounded priority queue of synthetic requests drained by
//! a background worker at bounded concurrency.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::keys::Principal;
use crate::response::{CacheRequest, ResponseCache, UpstreamResponse};
use crate::traits::Codec;

/// A synthetic request to pre-populate.
#[derive(Debug, Clone)]
pub struct WarmTarget {
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub principal: Principal,
    pub priority: u8,
}

impl WarmTarget {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, priority: u8) -> Self {
        Self {
            endpoint: endpoint.into(),
            query: Vec::new(),
            principal: Principal::Anonymous,
            priority,
        }
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    fn into_request(self) -> CacheRequest {
        let mut req = CacheRequest::get(self.endpoint).with_principal(self.principal);
        req.query = self.query;
        req
    }
}

/// Performs the equivalent of an in-process GET for a warm target. The
/// embedder supplies this; the cache owns storing the result.
#[async_trait]
pub trait WarmFetcher: Send + Sync {
    async fn fetch(&self, target: &WarmTarget) -> Result<UpstreamResponse>;
}

struct HeapItem {
    target: WarmTarget,
    seq: u64,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.target.priority == other.target.priority && self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, FIFO within a priority.
        self.target
            .priority
            .cmp(&other.target.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct WarmingCounters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    warmed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of warming counters.
#[derive(Debug, Clone)]
pub struct WarmingStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub warmed: u64,
    pub failed: u64,
    pub pending: usize,
}

/// Bounded priority queue of warm targets.
pub struct WarmingQueue {
    heap: Mutex<BinaryHeap<HeapItem>>,
    capacity: usize,
    seq: AtomicU64,
    notify: Notify,
    counters: WarmingCounters,
}

impl WarmingQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            seq: AtomicU64::new(0),
            notify: Notify::new(),
            counters: WarmingCounters::default(),
        }
    }

    /// Enqueue a target; returns `false` when the queue is at capacity.
    pub fn enqueue(&self, target: WarmTarget) -> bool {
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.capacity {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            heap.push(HeapItem { target, seq });
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    fn drain(&self, max: usize) -> Vec<WarmTarget> {
        let mut heap = self.heap.lock();
        let mut out = Vec::with_capacity(max.min(heap.len()));
        while out.len() < max {
            match heap.pop() {
                Some(item) => out.push(item.target),
                None => break,
            }
        }
        out
    }

    pub fn stats(&self) -> WarmingStats {
        WarmingStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            warmed: self.counters.warmed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: self.heap.lock().len(),
        }
    }
}

/// Spawn the warming drainer. It wakes on enqueue, fetches at bounded
/// concurrency, and writes results through the normal store path.
pub fn spawn_warmer<C: Codec + Send + Sync + 'static>(
    cache: Arc<ResponseCache<C>>,
    fetcher: Arc<dyn WarmFetcher>,
    concurrency: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let queue = Arc::clone(cache.warming());
        loop {
            let batch = queue.drain(concurrency.max(1));
            if batch.is_empty() {
                tokio::select! {
                    () = queue.notify.notified() => continue,
                    _ = shutdown_rx.recv() => {
                        info!("warming drainer shutting down");
                        return;
                    }
                }
            }

            futures_util::stream::iter(batch)
                .for_each_concurrent(concurrency.max(1), |target| {
                    let cache = Arc::clone(&cache);
                    let fetcher = Arc::clone(&fetcher);
                    let queue = Arc::clone(&queue);
                    async move {
                        let endpoint = target.endpoint.clone();
                        match fetcher.fetch(&target).await {
                            Ok(response) => {
                                let req = target.into_request();
                                if cache.store(&req, &response, None).await.is_ok() {
                                    queue.counters.warmed.fetch_add(1, Ordering::Relaxed);
                                    debug!(endpoint = %endpoint, "cache warmed");
                                } else {
                                    queue.counters.failed.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Err(err) => {
                                queue.counters.failed.fetch_add(1, Ordering::Relaxed);
                                warn!(endpoint = %endpoint, error = %err, "warming fetch failed");
                            }
                        }
                    }
                })
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_bounded_and_priority_ordered() {
        let queue = WarmingQueue::new(3);
        assert!(queue.enqueue(WarmTarget::new("/api/content/trending", 3)));
        assert!(queue.enqueue(WarmTarget::new("/api/voting/results/C1", 10)));
        assert!(queue.enqueue(WarmTarget::new("/api/leaderboard/users", 8)));
        assert!(!queue.enqueue(WarmTarget::new("/api/user/profile/U1", 5)));

        let drained = queue.drain(3);
        let endpoints: Vec<&str> = drained.iter().map(|t| t.endpoint.as_str()).collect();
        assert_eq!(
            endpoints,
            vec![
                "/api/voting/results/C1",
                "/api/leaderboard/users",
                "/api/content/trending"
            ]
        );
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn fifo_within_equal_priority() {
        let queue = WarmingQueue::new(8);
        queue.enqueue(WarmTarget::new("/a", 5));
        queue.enqueue(WarmTarget::new("/b", 5));
        queue.enqueue(WarmTarget::new("/c", 5));
        let drained = queue.drain(3);
        let endpoints: Vec<&str> = drained.iter().map(|t| t.endpoint.as_str()).collect();
        assert_eq!(endpoints, vec!["/a", "/b", "/c"]);
    }
}
