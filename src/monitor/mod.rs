//! Query performance monitor: passive observer of every DB call.
//!
//! `record` is non-blocking: after sampling, the record goes onto a bounded
//! channel and a worker task applies it to the engine state (per-hash
//! rolling counters, recent/slow rings, hints, regression baselines, alert
//! window). When the channel is full the record is dropped and counted.
//! Typed events (slow query, regression, alert) are published on a
//! broadcast channel.

mod normalize;

pub use normalize::{
    Hint, HintImpact, HintKind, MAX_NORMALIZED_LEN, QueryClass, QueryPriority, QueryVerb,
    classify, hints_for, normalize_sql, priority_for,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::keys::short_hash;

/// Request context attached to a query record.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub route: Option<String>,
    pub principal: Option<String>,
}

/// Typed events published by the monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    SlowQuery {
        hash: String,
        class: QueryClass,
        exec_millis: u64,
        threshold_millis: u64,
        very_slow: bool,
    },
    Regression {
        hash: String,
        baseline_avg: f64,
        current_avg: f64,
        regression_percent: f64,
    },
    Alert {
        kind: &'static str,
        slow_count: u64,
        window_secs: u64,
    },
}

/// Per-hash rolling statistics. Counters are monotonic within the
/// retention window.
#[derive(Debug, Clone)]
pub struct QueryStats {
    pub normalized: String,
    pub class: QueryClass,
    pub priority: QueryPriority,
    pub count: u64,
    pub sum_millis: u64,
    pub min_millis: u64,
    pub max_millis: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub baseline_avg: Option<f64>,
}

struct HashEntry {
    normalized: String,
    class: QueryClass,
    priority: QueryPriority,
    count: u64,
    sum_millis: u64,
    min_millis: u64,
    max_millis: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    baseline: Option<f64>,
    window_sum: u64,
    window_count: u64,
}

/// Samples required before a baseline qualifies, and the tumbling window
/// size used for regression comparison afterwards.
const REGRESSION_WINDOW: u64 = 10;

#[derive(Debug, Clone)]
struct RecentQuery {
    hash: String,
    exec_millis: u64,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SlowRecord {
    hash: String,
    class: QueryClass,
    exec_millis: u64,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredHint {
    hash: String,
    hint: Hint,
    at: DateTime<Utc>,
}

const SLOW_RING_CAPACITY: usize = 100;
const SUGGESTION_CAPACITY: usize = 256;

struct AlertBucket {
    window_start: Instant,
    count: u64,
}

struct RecordMsg {
    hash: String,
    normalized: String,
    class: QueryClass,
    priority: QueryPriority,
    exec_millis: u64,
    ctx: QueryContext,
}

enum Command {
    Record(RecordMsg),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct MonitorCounters {
    recorded: AtomicU64,
    sampled_out: AtomicU64,
    dropped: AtomicU64,
    slow_queries: AtomicU64,
    very_slow_queries: AtomicU64,
    regressions: AtomicU64,
    alerts: AtomicU64,
}

/// Snapshot of monitor counters.
#[derive(Debug, Clone)]
pub struct MonitorStats {
    pub recorded: u64,
    pub sampled_out: u64,
    pub dropped: u64,
    pub slow_queries: u64,
    pub very_slow_queries: u64,
    pub regressions: u64,
    pub alerts: u64,
    pub tracked_hashes: usize,
}

/// Percentiles over the recent ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct Percentiles {
    pub p95: u64,
    pub p99: u64,
    pub mean: f64,
    pub samples: usize,
}

struct MonitorInner {
    cfg: MonitorConfig,
    tx: mpsc::Sender<Command>,
    per_hash: DashMap<String, HashEntry>,
    recent: Mutex<VecDeque<RecentQuery>>,
    slow: Mutex<VecDeque<SlowRecord>>,
    suggestions: Mutex<VecDeque<StoredHint>>,
    alert: Mutex<AlertBucket>,
    events: broadcast::Sender<MonitorEvent>,
    counters: MonitorCounters,
    shutdown_tx: broadcast::Sender<()>,
}

/// The monitor handle. Cheap to clone; `record` never blocks.
pub struct QueryPerfMonitor {
    inner: Arc<MonitorInner>,
}

impl Clone for QueryPerfMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl QueryPerfMonitor {
    /// Build the monitor and start its worker and retention sweep.
    #[must_use]
    pub fn start(cfg: MonitorConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.admit_channel_capacity.max(1));
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, _) = broadcast::channel(1);
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                cfg,
                tx,
                per_hash: DashMap::new(),
                recent: Mutex::new(VecDeque::new()),
                slow: Mutex::new(VecDeque::new()),
                suggestions: Mutex::new(VecDeque::new()),
                alert: Mutex::new(AlertBucket {
                    window_start: Instant::now(),
                    count: 0,
                }),
                events,
                counters: MonitorCounters::default(),
                shutdown_tx,
            }),
        };
        monitor.spawn_worker(rx);
        monitor.spawn_retention_sweep();
        info!("query performance monitor started");
        monitor
    }

    /// Subscribe to slow-query, regression, and alert events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Record one DB call. Sampled admission; queries at or over their
    /// class SLA are always admitted. Drops (and counts) when the admit
    /// channel is full.
    pub fn record(&self, sql: &str, _params: &[&str], exec: Duration, ctx: QueryContext) {
        let exec_millis = u64::try_from(exec.as_millis()).unwrap_or(u64::MAX);
        let normalized = normalize_sql(sql);
        let (class, _verb) = classify(&normalized);
        let threshold = self.class_threshold(class);

        let is_slow = exec_millis > threshold;
        if !is_slow && self.inner.cfg.sampling_rate < 1.0 {
            let admit: f64 = rand::thread_rng().r#gen();
            if admit >= self.inner.cfg.sampling_rate {
                self.inner.counters.sampled_out.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let msg = RecordMsg {
            hash: short_hash(&normalized),
            normalized,
            class,
            priority: priority_for(class),
            exec_millis,
            ctx,
        };
        if self.inner.tx.try_send(Command::Record(msg)).is_err() {
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until every record admitted so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the worker and retention sweep.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
    }

    /// Rolling stats for one query hash.
    #[must_use]
    pub fn stats_for(&self, hash: &str) -> Option<QueryStats> {
        self.inner.per_hash.get(hash).map(|e| QueryStats {
            normalized: e.normalized.clone(),
            class: e.class,
            priority: e.priority,
            count: e.count,
            sum_millis: e.sum_millis,
            min_millis: e.min_millis,
            max_millis: e.max_millis,
            first_seen: e.first_seen,
            last_seen: e.last_seen,
            baseline_avg: e.baseline,
        })
    }

    /// Recent admitted queries as `(hash, exec_millis)`, oldest first.
    #[must_use]
    pub fn recent_queries(&self) -> Vec<(String, u64)> {
        self.inner
            .recent
            .lock()
            .iter()
            .map(|r| (r.hash.clone(), r.exec_millis))
            .collect()
    }

    /// SLA breaches currently held in the slow ring, oldest first.
    #[must_use]
    pub fn slow_queries(&self) -> Vec<(String, QueryClass, u64)> {
        self.inner
            .slow
            .lock()
            .iter()
            .map(|r| (r.hash.clone(), r.class, r.exec_millis))
            .collect()
    }

    /// Current optimization suggestions, newest last.
    #[must_use]
    pub fn suggestions(&self) -> Vec<(String, Hint)> {
        self.inner
            .suggestions
            .lock()
            .iter()
            .map(|s| (s.hash.clone(), s.hint.clone()))
            .collect()
    }

    /// p95/p99/mean over the recent ring, using
    /// `sorted[ceil(p/100 × n) − 1]`.
    #[must_use]
    pub fn percentiles(&self) -> Percentiles {
        let recent = self.inner.recent.lock();
        if recent.is_empty() {
            return Percentiles::default();
        }
        let mut values: Vec<u64> = recent.iter().map(|r| r.exec_millis).collect();
        values.sort_unstable();
        let sum: u64 = values.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let mean = sum as f64 / values.len() as f64;
        Percentiles {
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
            mean,
            samples: values.len(),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        let c = &self.inner.counters;
        MonitorStats {
            recorded: c.recorded.load(Ordering::Relaxed),
            sampled_out: c.sampled_out.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            slow_queries: c.slow_queries.load(Ordering::Relaxed),
            very_slow_queries: c.very_slow_queries.load(Ordering::Relaxed),
            regressions: c.regressions.load(Ordering::Relaxed),
            alerts: c.alerts.load(Ordering::Relaxed),
            tracked_hashes: self.inner.per_hash.len(),
        }
    }

    fn class_threshold(&self, class: QueryClass) -> u64 {
        let cfg = &self.inner.cfg;
        let threshold = match class {
            QueryClass::Voting => cfg.voting_query_threshold,
            QueryClass::Leaderboard => cfg.leaderboard_query_threshold,
            QueryClass::Tournament => cfg.tournament_query_threshold,
            _ => cfg.slow_query_threshold,
        };
        u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX)
    }

    fn spawn_worker(&self, mut rx: mpsc::Receiver<Command>) {
        let monitor = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = rx.recv() => match command {
                        Some(Command::Record(msg)) => monitor.apply(msg),
                        Some(Command::Flush(done)) => {
                            let _ = done.send(());
                        }
                        None => return,
                    },
                    _ = shutdown_rx.recv() => {
                        info!("query monitor worker shutting down");
                        return;
                    }
                }
            }
        });
    }

    fn spawn_retention_sweep(&self) {
        let monitor = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => monitor.sweep_retention(),
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
    }

    fn apply(&self, msg: RecordMsg) {
        let inner = &self.inner;
        inner.counters.recorded.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let threshold = self.class_threshold(msg.class);

        // Per-hash rolling counters plus regression bookkeeping. The map
        // entry is the atomic unit: updates for one hash are serialized.
        let regression = {
            let mut entry = inner
                .per_hash
                .entry(msg.hash.clone())
                .or_insert_with(|| HashEntry {
                    normalized: msg.normalized.clone(),
                    class: msg.class,
                    priority: msg.priority,
                    count: 0,
                    sum_millis: 0,
                    min_millis: u64::MAX,
                    max_millis: 0,
                    first_seen: now,
                    last_seen: now,
                    baseline: None,
                    window_sum: 0,
                    window_count: 0,
                });
            entry.count += 1;
            entry.sum_millis += msg.exec_millis;
            entry.min_millis = entry.min_millis.min(msg.exec_millis);
            entry.max_millis = entry.max_millis.max(msg.exec_millis);
            entry.last_seen = now;
            self.update_regression(&mut entry, msg.exec_millis)
        };

        if let Some((baseline, current)) = regression {
            if inner.cfg.enable_regression_detection {
                inner.counters.regressions.fetch_add(1, Ordering::Relaxed);
                let percent = (current - baseline) / baseline * 100.0;
                warn!(
                    hash = %msg.hash,
                    baseline_avg = baseline,
                    current_avg = current,
                    regression_percent = percent,
                    "query latency regression"
                );
                let _ = inner.events.send(MonitorEvent::Regression {
                    hash: msg.hash.clone(),
                    baseline_avg: baseline,
                    current_avg: current,
                    regression_percent: percent,
                });
            }
        }

        // Recent ring.
        {
            let mut recent = inner.recent.lock();
            if recent.len() >= inner.cfg.max_stored_queries {
                recent.pop_front();
            }
            recent.push_back(RecentQuery {
                hash: msg.hash.clone(),
                exec_millis: msg.exec_millis,
                at: now,
            });
        }

        // SLA check, slow ring, alerting.
        if msg.exec_millis > threshold {
            let very_slow_millis =
                u64::try_from(inner.cfg.very_slow_query_threshold.as_millis()).unwrap_or(u64::MAX);
            let very_slow = msg.exec_millis > very_slow_millis;
            inner.counters.slow_queries.fetch_add(1, Ordering::Relaxed);
            if very_slow {
                inner.counters.very_slow_queries.fetch_add(1, Ordering::Relaxed);
            }

            {
                let mut slow = inner.slow.lock();
                if slow.len() >= SLOW_RING_CAPACITY {
                    slow.pop_front();
                }
                slow.push_back(SlowRecord {
                    hash: msg.hash.clone(),
                    class: msg.class,
                    exec_millis: msg.exec_millis,
                    at: now,
                });
            }

            debug!(
                hash = %msg.hash,
                class = msg.class.as_str(),
                exec_millis = msg.exec_millis,
                route = msg.ctx.route.as_deref().unwrap_or("-"),
                "slow query"
            );
            let _ = inner.events.send(MonitorEvent::SlowQuery {
                hash: msg.hash.clone(),
                class: msg.class,
                exec_millis: msg.exec_millis,
                threshold_millis: threshold,
                very_slow,
            });

            self.bump_alert_window();
        }

        // Optimization hints.
        let hints = hints_for(&msg.normalized, msg.exec_millis, msg.class);
        if !hints.is_empty() {
            let mut suggestions = inner.suggestions.lock();
            for hint in hints {
                if suggestions.len() >= SUGGESTION_CAPACITY {
                    suggestions.pop_front();
                }
                suggestions.push_back(StoredHint {
                    hash: msg.hash.clone(),
                    hint,
                    at: now,
                });
            }
        }
    }

    /// Baseline at `REGRESSION_WINDOW` samples, then compare tumbling
    /// windows of the same size against it. Returns `(baseline, current)`
    /// when a window regresses past the threshold; the entry re-baselines.
    fn update_regression(&self, entry: &mut HashEntry, exec_millis: u64) -> Option<(f64, f64)> {
        #[allow(clippy::cast_precision_loss)]
        match entry.baseline {
            None => {
                if entry.count >= REGRESSION_WINDOW {
                    entry.baseline = Some(entry.sum_millis as f64 / entry.count as f64);
                    entry.window_sum = 0;
                    entry.window_count = 0;
                }
                None
            }
            Some(baseline) => {
                entry.window_sum += exec_millis;
                entry.window_count += 1;
                if entry.window_count < REGRESSION_WINDOW {
                    return None;
                }
                let current = entry.window_sum as f64 / entry.window_count as f64;
                entry.window_sum = 0;
                entry.window_count = 0;
                if baseline > 0.0
                    && (current - baseline) / baseline > self.inner.cfg.regression_threshold
                {
                    entry.baseline = Some(current);
                    Some((baseline, current))
                } else {
                    None
                }
            }
        }
    }

    fn bump_alert_window(&self) {
        let inner = &self.inner;
        let mut bucket = inner.alert.lock();
        if bucket.window_start.elapsed() > inner.cfg.alert_window {
            bucket.window_start = Instant::now();
            bucket.count = 0;
        }
        bucket.count += 1;
        if bucket.count >= inner.cfg.alert_threshold {
            let slow_count = bucket.count;
            bucket.count = 0;
            bucket.window_start = Instant::now();
            drop(bucket);

            inner.counters.alerts.fetch_add(1, Ordering::Relaxed);
            warn!(slow_count, "slow-query alert threshold reached");
            let _ = inner.events.send(MonitorEvent::Alert {
                kind: "slow_queries_threshold",
                slow_count,
                window_secs: inner.cfg.alert_window.as_secs(),
            });
        }
    }

    fn sweep_retention(&self) {
        let inner = &self.inner;
        let retention = chrono::TimeDelta::from_std(inner.cfg.retention_period)
            .unwrap_or_else(|_| chrono::TimeDelta::hours(24));
        let cutoff = Utc::now() - retention;

        inner.recent.lock().retain(|r| r.at > cutoff);
        inner.slow.lock().retain(|r| r.at > cutoff);
        inner.suggestions.lock().retain(|s| s.at > cutoff);
        inner.per_hash.retain(|_, e| e.last_seen > cutoff);

        // Stale alert buckets reset after ten idle windows.
        let mut bucket = inner.alert.lock();
        if bucket.window_start.elapsed() > inner.cfg.alert_window * 10 {
            bucket.window_start = Instant::now();
            bucket.count = 0;
        }
        debug!("monitor retention sweep complete");
    }
}

/// `p`th percentile of ascending-sorted `values`:
/// `values[ceil(p/100 × n) − 1]`.
fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(values.len() - 1);
    values.get(idx).copied().unwrap_or(0)
}
