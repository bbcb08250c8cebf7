//! Event-driven invalidation bus.
//!
//! Emitted domain events are filtered, coalesced per `(kind, entity)` batch
//! key, expanded through the rule table and cascade graph, and executed as
//! pattern deletions against the cache manager with per-action retries.
//!
//! Scheduling: high-priority events (votes, tournament updates, leaderboard
//! refreshes) flush within `invalidation_delay`; batchable events wait for
//! `batch_window` or `invalidation_batch_size` merged peers. Merged batches
//! union their payload ids so each downstream pattern is deleted at most
//! once per flush. Batches for one key never execute concurrently; across
//! keys no order is guaranteed.

mod rules;

pub use rules::{Action, Aspect, Bindings, actions_for, expand_cascade, materialize, root_aspects};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

use crate::codec::JsonCodec;
use crate::config::InvalidationConfig;
use crate::events::{DomainEvent, EventKind};
use crate::manager::CacheManager;
use crate::traits::Codec;

type BatchKey = (EventKind, Option<String>);
type ExecLocks = DashMap<BatchKey, Arc<AsyncMutex<()>>>;

/// An action that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub kind: EventKind,
    pub action: Action,
    pub attempts: u32,
    pub reason: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

struct PendingBatch {
    bindings: Bindings,
    roots: BTreeSet<Aspect>,
    merged: usize,
    flush_at: Instant,
}

/// RAII removal of a per-key execution lock once the holder finishes.
struct LockCleanup<'a> {
    map: &'a ExecLocks,
    key: BatchKey,
}

impl Drop for LockCleanup<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Default)]
struct BusCounters {
    events_received: AtomicU64,
    events_filtered: AtomicU64,
    events_discarded: AtomicU64,
    batches_flushed: AtomicU64,
    actions_executed: AtomicU64,
    actions_failed: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Snapshot of bus counters.
#[derive(Debug, Clone)]
pub struct InvalidationStats {
    pub events_received: u64,
    pub events_filtered: u64,
    pub events_discarded: u64,
    pub batches_flushed: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
    pub dead_lettered: u64,
    pub pending_batches: usize,
}

struct BusInner<C: Codec> {
    manager: CacheManager<C>,
    cfg: InvalidationConfig,
    filter: DashMap<String, Instant>,
    batches: Mutex<HashMap<BatchKey, PendingBatch>>,
    exec_locks: ExecLocks,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    counters: BusCounters,
    shutdown_tx: broadcast::Sender<()>,
}

/// The invalidation bus. Cheap to clone; `emit` is non-blocking.
pub struct InvalidationBus<C: Codec = JsonCodec> {
    inner: Arc<BusInner<C>>,
}

impl<C: Codec> Clone for InvalidationBus<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Codec + 'static> InvalidationBus<C> {
    /// Build the bus and start its background flusher (and the optional
    /// periodic leaderboard refresh).
    #[must_use]
    pub fn start(manager: CacheManager<C>, cfg: InvalidationConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let bus = Self {
            inner: Arc::new(BusInner {
                manager,
                cfg,
                filter: DashMap::new(),
                batches: Mutex::new(HashMap::new()),
                exec_locks: DashMap::new(),
                dead_letters: Mutex::new(VecDeque::new()),
                counters: BusCounters::default(),
                shutdown_tx,
            }),
        };
        bus.spawn_flusher();
        bus.spawn_leaderboard_refresh();
        info!("invalidation bus started");
        bus
    }

    /// Enqueue an event. Never blocks beyond a bounded critical section.
    pub fn emit(&self, event: DomainEvent) {
        let inner = &self.inner;
        inner.counters.events_received.fetch_add(1, Ordering::Relaxed);

        if !inner.cfg.enable_smart_invalidation {
            inner.counters.events_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if inner.cfg.enable_event_filtering && self.is_duplicate(&event) {
            inner.counters.events_filtered.fetch_add(1, Ordering::Relaxed);
            debug!(kind = ?event.kind(), "event filtered as duplicate");
            return;
        }

        let delay = if event.is_high_priority() {
            inner.cfg.invalidation_delay
        } else {
            inner.cfg.batch_window
        };
        let key: BatchKey = (event.kind(), event.primary_entity().map(str::to_string));

        let due = {
            let mut batches = inner.batches.lock();
            let batch = batches.entry(key.clone()).or_insert_with(|| PendingBatch {
                bindings: Bindings::default(),
                roots: BTreeSet::new(),
                merged: 0,
                flush_at: Instant::now() + delay,
            });
            batch.bindings.absorb(&event);
            batch.roots.extend(root_aspects(&event));
            batch.merged += 1;
            if batch.merged >= inner.cfg.invalidation_batch_size {
                batches.remove(&key)
            } else {
                None
            }
        };

        if let Some(batch) = due {
            // Batch hit the size ceiling: flush without waiting for the window.
            let bus = self.clone();
            tokio::spawn(async move {
                bus.execute_batch(key, batch).await;
            });
        }
    }

    /// Flush every pending batch now and wait for the executions. Used by
    /// shutdown and by embedders that need a consistency point.
    pub async fn flush_now(&self) {
        let drained: Vec<(BatchKey, PendingBatch)> = {
            let mut batches = self.inner.batches.lock();
            batches.drain().collect()
        };
        for (key, batch) in drained {
            self.execute_batch(key, batch).await;
        }
    }

    /// Signal shutdown and drain pending batches once, under the configured
    /// hard ceiling.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        let ceiling = self.inner.cfg.shutdown_drain_ceiling;
        if tokio::time::timeout(ceiling, self.flush_now()).await.is_err() {
            warn!("shutdown drain exceeded ceiling; abandoning pending invalidations");
        }
    }

    /// Dead-lettered actions, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> InvalidationStats {
        let c = &self.inner.counters;
        InvalidationStats {
            events_received: c.events_received.load(Ordering::Relaxed),
            events_filtered: c.events_filtered.load(Ordering::Relaxed),
            events_discarded: c.events_discarded.load(Ordering::Relaxed),
            batches_flushed: c.batches_flushed.load(Ordering::Relaxed),
            actions_executed: c.actions_executed.load(Ordering::Relaxed),
            actions_failed: c.actions_failed.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            pending_batches: self.inner.batches.lock().len(),
        }
    }

    fn is_duplicate(&self, event: &DomainEvent) -> bool {
        let token = event.filter_token();
        let window = self.inner.cfg.event_filter_window;
        let now = Instant::now();
        match self.inner.filter.entry(token) {
            dashmap::mapref::entry::Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) < window {
                    true
                } else {
                    seen.insert(now);
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                false
            }
        }
    }

    fn spawn_flusher(&self) {
        let bus = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown_rx.recv() => {
                        info!("invalidation flusher shutting down");
                        return;
                    }
                }

                let now = Instant::now();
                let due: Vec<(BatchKey, PendingBatch)> = {
                    let mut batches = bus.inner.batches.lock();
                    let keys: Vec<BatchKey> = batches
                        .iter()
                        .filter(|(_, b)| b.flush_at <= now)
                        .map(|(k, _)| k.clone())
                        .collect();
                    keys.into_iter()
                        .filter_map(|k| batches.remove_entry(&k))
                        .collect()
                };
                for (key, batch) in due {
                    let bus = bus.clone();
                    tokio::spawn(async move {
                        bus.execute_batch(key, batch).await;
                    });
                }

                // Periodic compaction of the duplicate filter.
                ticks += 1;
                if ticks % 100 == 0 {
                    let window = bus.inner.cfg.event_filter_window;
                    bus.inner
                        .filter
                        .retain(|_, seen| now.duration_since(*seen) < window);
                }
            }
        });
    }

    fn spawn_leaderboard_refresh(&self) {
        let Some(interval) = self.inner.cfg.leaderboard_refresh_interval else {
            return;
        };
        let bus = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => bus.emit(DomainEvent::LeaderboardRefresh),
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
    }

    async fn execute_batch(&self, key: BatchKey, batch: PendingBatch) {
        let inner = &self.inner;

        // Serialize flushes per batch key; across keys order is free.
        let lock = inner
            .exec_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let _cleanup = LockCleanup {
            map: &inner.exec_locks,
            key: key.clone(),
        };

        let roots: Vec<Aspect> = batch.roots.iter().copied().collect();
        let actions = actions_for(&roots, &batch.bindings);
        debug!(
            kind = ?key.0,
            entity = key.1.as_deref().unwrap_or("-"),
            merged = batch.merged,
            actions = actions.len(),
            "flushing invalidation batch"
        );

        for action in actions {
            self.run_action(key.0, action).await;
        }
        inner.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    async fn run_action(&self, kind: EventKind, action: Action) {
        let inner = &self.inner;
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        let max_attempts = inner.cfg.max_retries + 1;

        for attempt in 1..=max_attempts {
            match inner
                .manager
                .invalidate_pattern(action.namespace, &action.pattern)
                .await
            {
                Ok(_) => {
                    inner.counters.actions_executed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    inner.counters.actions_failed.fetch_add(1, Ordering::Relaxed);
                    if attempt == max_attempts {
                        warn!(
                            namespace = %action.namespace,
                            pattern = %action.pattern,
                            attempts = attempt,
                            error = %err,
                            "invalidation dead-lettered"
                        );
                        self.dead_letter(kind, action, attempt, err.to_string());
                        return;
                    }
                    let backoff = inner.cfg.retry_delay * attempt;
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        _ = shutdown_rx.recv() => {
                            self.dead_letter(kind, action, attempt, "shutdown".to_string());
                            return;
                        }
                    }
                }
            }
        }
    }

    fn dead_letter(&self, kind: EventKind, action: Action, attempts: u32, reason: String) {
        let inner = &self.inner;
        inner.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let mut log = inner.dead_letters.lock();
        if log.len() >= inner.cfg.dead_letter_capacity {
            log.pop_front();
        }
        log.push_back(DeadLetter {
            kind,
            action,
            attempts,
            reason,
            at: chrono::Utc::now(),
        });
    }
}
