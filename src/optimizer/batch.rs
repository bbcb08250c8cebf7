//! Batching of safe idempotent reads.
//!
//! Requests on a batchable pattern are held until `batch_size` peers
//! accumulate or `batch_window` elapses, then released together in priority
//! order. `max_batch_wait` bounds the hold time of any request. When a
//! release happens, held requests of strictly higher priority anywhere in
//! the batcher are released in the same cycle, ahead of the triggering
//! batch, so a voting read is never dispatched later than a content read it
//! followed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use crate::config::OptimizerConfig;

struct Waiting {
    priority: u8,
    enqueued: Instant,
    seq: u64,
    release: oneshot::Sender<()>,
}

#[derive(Default)]
struct BatchCounters {
    held: AtomicU64,
    dispatched: AtomicU64,
    batches: AtomicU64,
}

/// Snapshot of batcher counters.
#[derive(Debug, Clone)]
pub struct BatchStats {
    pub held: u64,
    pub dispatched: u64,
    pub batches: u64,
    pub pending: usize,
}

struct BatcherInner {
    batch_size: usize,
    batch_window: Duration,
    max_batch_wait: Duration,
    queues: Mutex<HashMap<String, Vec<Waiting>>>,
    seq: AtomicU64,
    counters: BatchCounters,
}

/// Holds and releases batchable reads. Cheap to clone.
#[derive(Clone)]
pub struct ReadBatcher {
    inner: Arc<BatcherInner>,
}

impl ReadBatcher {
    /// Build the batcher and start its release ticker.
    #[must_use]
    pub fn start(cfg: &OptimizerConfig, shutdown_rx: broadcast::Receiver<()>) -> Self {
        let batcher = Self {
            inner: Arc::new(BatcherInner {
                batch_size: cfg.batch_size.max(1),
                batch_window: cfg.batch_window,
                max_batch_wait: cfg.max_batch_wait,
                queues: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                counters: BatchCounters::default(),
            }),
        };
        batcher.spawn_ticker(shutdown_rx);
        batcher
    }

    /// Whether this request qualifies for batching: a GET without a
    /// realtime marker in its route.
    #[must_use]
    pub fn is_batchable(method: &str, path: &str) -> bool {
        method == "GET" && !path.contains("live") && !path.contains("realtime")
    }

    /// Hold the caller until its batch dispatches. Resolves immediately if
    /// the submission itself fills the batch.
    pub async fn submit(&self, pattern: &str, priority: u8) {
        let (tx, rx) = oneshot::channel();
        let ready = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(pattern.to_string()).or_default();
            queue.push(Waiting {
                priority,
                enqueued: Instant::now(),
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                release: tx,
            });
            self.inner.counters.held.fetch_add(1, Ordering::Relaxed);
            queue.len() >= self.inner.batch_size
        };

        if ready {
            self.release_due(true);
        }

        // A dropped batcher releases everyone rather than wedging requests.
        let _ = rx.await;
    }

    pub fn stats(&self) -> BatchStats {
        let pending = self.inner.queues.lock().values().map(Vec::len).sum();
        BatchStats {
            held: self.inner.counters.held.load(Ordering::Relaxed),
            dispatched: self.inner.counters.dispatched.load(Ordering::Relaxed),
            batches: self.inner.counters.batches.load(Ordering::Relaxed),
            pending,
        }
    }

    fn spawn_ticker(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let batcher = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => batcher.release_due(false),
                    _ = shutdown_rx.recv() => {
                        info!("read batcher shutting down");
                        batcher.release_all();
                        return;
                    }
                }
            }
        });
    }

    /// Release every queue that is due (full, window elapsed, or holding a
    /// waiter past the liveness ceiling), plus any strictly-higher-priority
    /// waiter elsewhere, in one priority-ordered dispatch.
    fn release_due(&self, size_triggered: bool) {
        let inner = &self.inner;
        let now = Instant::now();
        let mut released: Vec<Waiting> = Vec::new();

        {
            let mut queues = inner.queues.lock();

            let due_patterns: Vec<String> = queues
                .iter()
                .filter(|(_, q)| {
                    (size_triggered && q.len() >= inner.batch_size)
                        || q.iter().any(|w| {
                            now.duration_since(w.enqueued) >= inner.batch_window
                                || now.duration_since(w.enqueued) >= inner.max_batch_wait
                        })
                })
                .map(|(p, _)| p.clone())
                .collect();

            if due_patterns.is_empty() {
                return;
            }

            let mut floor = u8::MAX;
            for pattern in &due_patterns {
                if let Some(queue) = queues.remove(pattern) {
                    for waiting in &queue {
                        floor = floor.min(waiting.priority);
                    }
                    released.extend(queue);
                }
            }

            // Anything more urgent than the dispatching batch goes with it.
            for queue in queues.values_mut() {
                let mut kept = Vec::with_capacity(queue.len());
                for waiting in queue.drain(..) {
                    if waiting.priority > floor {
                        released.push(waiting);
                    } else {
                        kept.push(waiting);
                    }
                }
                *queue = kept;
            }
            queues.retain(|_, q| !q.is_empty());
        }

        if released.is_empty() {
            return;
        }

        // Priority order, FIFO within a priority.
        released.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        let count = released.len();
        for waiting in released {
            let _ = waiting.release.send(());
        }
        inner.counters.dispatched.fetch_add(count as u64, Ordering::Relaxed);
        inner.counters.batches.fetch_add(1, Ordering::Relaxed);
        debug!(count, "batch dispatched");
    }

    fn release_all(&self) {
        let mut queues = self.inner.queues.lock();
        for (_, queue) in queues.drain() {
            for waiting in queue {
                let _ = waiting.release.send(());
            }
        }
    }
}
