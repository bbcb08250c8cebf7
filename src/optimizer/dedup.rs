//! GET deduplication: concurrent identical requests share one handler run.
//!
//! The first caller for a dedup key becomes the originator and executes the
//! handler; everyone else suspends on a watch channel and receives the same
//! response bytes and status. Waiter deadlines are honoured without
//! affecting the originator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{BackboneError, Result};
use crate::keys::Principal;
use crate::response::CacheRequest;

/// The response shared between an originator and its waiters.
#[derive(Debug)]
pub struct SharedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Tuple identifying coalescable requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub method: String,
    pub endpoint: String,
    pub canonical_query: String,
    pub principal: Principal,
}

impl DedupKey {
    #[must_use]
    pub fn from_request(req: &CacheRequest) -> Self {
        Self {
            method: req.method.clone(),
            endpoint: req.path.clone(),
            canonical_query: req.canonical_query(),
            principal: req.principal.clone(),
        }
    }
}

/// How this caller participated in a deduplicated execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupRole {
    /// Ran the handler; the response is fresh.
    Originator,
    /// Shared the originator's response (`X-Cache: HIT-DEDUPLICATED`).
    Deduplicated,
}

type Slot = Option<Arc<SharedResponse>>;

struct InFlight {
    started: Instant,
    rx: watch::Receiver<Slot>,
}

/// RAII removal of the in-flight record, even if the handler panics.
struct InFlightCleanup<'a> {
    map: &'a DashMap<DedupKey, InFlight>,
    key: DedupKey,
}

impl Drop for InFlightCleanup<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

#[derive(Default)]
struct DedupCounters {
    originators: AtomicU64,
    deduplicated: AtomicU64,
    deadline_expired: AtomicU64,
    originator_gone: AtomicU64,
}

/// Snapshot of deduplicator counters.
#[derive(Debug, Clone)]
pub struct DedupStats {
    pub originators: u64,
    pub deduplicated: u64,
    pub deadline_expired: u64,
    pub originator_gone: u64,
    pub in_flight: usize,
}

/// Coalesces concurrent identical GETs inside the deduplication window.
pub struct Deduplicator {
    in_flight: DashMap<DedupKey, InFlight>,
    window: Duration,
    counters: DedupCounters,
}

impl Deduplicator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            in_flight: DashMap::new(),
            window,
            counters: DedupCounters::default(),
        }
    }

    /// Run `handler` once per key per window. Followers suspend until the
    /// originator settles and observe the identical response.
    ///
    /// # Errors
    ///
    /// `DeadlineExceeded` when a waiter's deadline elapses first;
    /// `OriginatorGone` when the originator dropped without settling.
    /// Originator errors propagate to the originator only.
    pub async fn execute<F, Fut>(
        &self,
        key: DedupKey,
        deadline: Option<Instant>,
        handler: F,
    ) -> Result<(Arc<SharedResponse>, DedupRole)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SharedResponse>>,
    {
        // Decide role under the map entry, then release it before awaiting.
        let follower_rx: Option<watch::Receiver<Slot>>;
        let leader_tx: Option<watch::Sender<Slot>>;
        {
            match self.in_flight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                    if entry.get().started.elapsed() < self.window {
                        follower_rx = Some(entry.get().rx.clone());
                        leader_tx = None;
                    } else {
                        // Stale record: take over as the new originator.
                        let (tx, rx) = watch::channel(None);
                        entry.insert(InFlight {
                            started: Instant::now(),
                            rx,
                        });
                        follower_rx = None;
                        leader_tx = Some(tx);
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let (tx, rx) = watch::channel(None);
                    slot.insert(InFlight {
                        started: Instant::now(),
                        rx,
                    });
                    follower_rx = None;
                    leader_tx = Some(tx);
                }
            }
        }

        if let Some(rx) = follower_rx {
            self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            let response = self.wait_settled(rx, deadline).await?;
            return Ok((response, DedupRole::Deduplicated));
        }

        let tx = leader_tx.unwrap_or_else(|| watch::channel(None).0);
        self.counters.originators.fetch_add(1, Ordering::Relaxed);
        let _cleanup = InFlightCleanup {
            map: &self.in_flight,
            key,
        };

        let response = Arc::new(handler().await?);
        // Publish to every suspended follower before the record is removed.
        let _ = tx.send(Some(Arc::clone(&response)));
        debug!("deduplicated request settled");
        Ok((response, DedupRole::Originator))
    }

    async fn wait_settled(
        &self,
        mut rx: watch::Receiver<Slot>,
        deadline: Option<Instant>,
    ) -> Result<Arc<SharedResponse>> {
        loop {
            if let Some(response) = rx.borrow().as_ref() {
                return Ok(Arc::clone(response));
            }
            let changed = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        self.counters.deadline_expired.fetch_add(1, Ordering::Relaxed);
                        return Err(BackboneError::DeadlineExceeded);
                    }
                    match tokio::time::timeout(remaining, rx.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => {
                            self.counters.deadline_expired.fetch_add(1, Ordering::Relaxed);
                            return Err(BackboneError::DeadlineExceeded);
                        }
                    }
                }
                None => rx.changed().await,
            };
            if changed.is_err() {
                self.counters.originator_gone.fetch_add(1, Ordering::Relaxed);
                return Err(BackboneError::OriginatorGone);
            }
        }
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            originators: self.counters.originators.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            deadline_expired: self.counters.deadline_expired.load(Ordering::Relaxed),
            originator_gone: self.counters.originator_gone.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn key(path: &str) -> DedupKey {
        DedupKey {
            method: "GET".into(),
            endpoint: path.into(),
            canonical_query: String::new(),
            principal: Principal::user("U7"),
        }
    }

    #[tokio::test]
    async fn concurrent_identical_gets_share_one_execution() {
        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(1)));
        let handler_runs = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let dedup = Arc::clone(&dedup);
            let runs = Arc::clone(&handler_runs);
            tasks.push(tokio::spawn(async move {
                dedup
                    .execute(key("/api/clans/42"), None, || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(SharedResponse {
                            status: 200,
                            headers: Vec::new(),
                            body: Bytes::from_static(b"{\"clan\":42}"),
                        })
                    })
                    .await
            }));
        }

        let mut originators = 0;
        let mut followers = 0;
        let mut bodies = Vec::new();
        for task in tasks {
            let (response, role) = task.await.unwrap().unwrap();
            bodies.push(response.body.clone());
            match role {
                DedupRole::Originator => originators += 1,
                DedupRole::Deduplicated => followers += 1,
            }
        }

        assert_eq!(handler_runs.load(Ordering::SeqCst), 1);
        assert_eq!(originators, 1);
        assert_eq!(followers, 19);
        assert!(bodies.iter().all(|b| b == &bodies[0]));
    }

    #[tokio::test]
    async fn waiter_deadline_does_not_affect_originator() {
        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(1)));

        let leader = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup
                    .execute(key("/slow"), None, || async {
                        tokio::time::sleep(Duration::from_millis(150)).await;
                        Ok(SharedResponse {
                            status: 200,
                            headers: Vec::new(),
                            body: Bytes::from_static(b"ok"),
                        })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let impatient = dedup
            .execute(
                key("/slow"),
                Some(Instant::now() + Duration::from_millis(30)),
                || async { unreachable!("follower never runs the handler") },
            )
            .await;
        assert!(matches!(impatient, Err(BackboneError::DeadlineExceeded)));

        let (response, role) = leader.await.unwrap().unwrap();
        assert_eq!(role, DedupRole::Originator);
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn sequential_requests_each_originate() {
        let dedup = Deduplicator::new(Duration::from_millis(100));
        for _ in 0..3 {
            let (_, role) = dedup
                .execute(key("/api/users/1"), None, || async {
                    Ok(SharedResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: Bytes::new(),
                    })
                })
                .await
                .unwrap();
            assert_eq!(role, DedupRole::Originator);
        }
        assert_eq!(dedup.stats().originators, 3);
        assert_eq!(dedup.stats().deduplicated, 0);
    }
}
