//! Request optimizer: the front of the pipeline.
//!
//! Assigns request ids, classifies gaming priority, coalesces identical
//! GETs, optionally batches safe reads, compresses text-like responses,
//! and emits the standard security/CORS header set. The metrics hook wraps
//! response completion so the embedder can record timing without patching
//! its writer.

mod batch;
mod dedup;

pub use batch::{BatchStats, ReadBatcher};
pub use dedup::{DedupKey, DedupRole, DedupStats, Deduplicator, SharedResponse};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use rand::Rng;
use tokio::sync::broadcast;

use crate::compress::{gzip, is_text_like};
use crate::config::OptimizerConfig;
use crate::error::Result;

/// Closed priority table for gaming endpoints.
#[must_use]
pub fn endpoint_priority(path: &str) -> u8 {
    if path.contains("/voting") {
        10
    } else if path.contains("/leaderboard") || path.contains("/tournament") {
        8
    } else if path.contains("live") || path.contains("realtime") {
        7
    } else if path.contains("/user") || path.contains("/clan") {
        5
    } else if path.contains("/content") {
        3
    } else {
        1
    }
}

#[derive(Default)]
struct OptimizerCounters {
    requests: AtomicU64,
    responses: AtomicU64,
    cached_responses: AtomicU64,
    response_millis: AtomicU64,
    compressed_responses: AtomicU64,
    compression_saved_bytes: AtomicU64,
    status_2xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
}

/// Snapshot of optimizer counters.
#[derive(Debug, Clone)]
pub struct OptimizerStats {
    pub requests: u64,
    pub responses: u64,
    pub cached_responses: u64,
    pub avg_response_millis: f64,
    pub compressed_responses: u64,
    pub compression_saved_bytes: u64,
    pub status_2xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub dedup: DedupStats,
}

/// Started by [`RequestOptimizer::begin`]; finished by
/// [`RequestOptimizer::complete`] once the response has been written.
#[derive(Debug)]
pub struct ResponseObservation {
    pub request_id: String,
    pub priority: u8,
    started: Instant,
}

impl ResponseObservation {
    /// Elapsed time so far, for an `X-Response-Time` header.
    #[must_use]
    pub fn elapsed_millis(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Front-of-pipeline request services.
pub struct RequestOptimizer {
    cfg: OptimizerConfig,
    seq: AtomicU64,
    dedup: Deduplicator,
    batcher: Option<ReadBatcher>,
    counters: OptimizerCounters,
}

impl RequestOptimizer {
    #[must_use]
    pub fn new(cfg: OptimizerConfig, shutdown_rx: broadcast::Receiver<()>) -> Self {
        let dedup = Deduplicator::new(cfg.deduplication_window);
        let batcher = cfg
            .enable_batching
            .then(|| ReadBatcher::start(&cfg, shutdown_rx));
        Self {
            cfg,
            seq: AtomicU64::new(0),
            dedup,
            batcher,
            counters: OptimizerCounters::default(),
        }
    }

    #[must_use]
    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    #[must_use]
    pub fn batcher(&self) -> Option<&ReadBatcher> {
        self.batcher.as_ref()
    }

    #[must_use]
    pub fn deduplication_enabled(&self) -> bool {
        self.cfg.enable_deduplication
    }

    /// Keep-alive timeout the embedding server should advertise.
    #[must_use]
    pub fn keep_alive_timeout(&self) -> std::time::Duration {
        self.cfg.keep_alive_timeout
    }

    /// Socket ceiling the embedding server should apply.
    #[must_use]
    pub fn max_sockets(&self) -> usize {
        self.cfg.max_sockets
    }

    /// Monotonic counter + wall-clock millis + 9 random hex chars.
    pub fn request_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let millis = chrono::Utc::now().timestamp_millis();
        let noise: u64 = rand::thread_rng().gen_range(0..0x10_0000_0000u64);
        format!("req_{millis}_{seq}_{noise:09x}")
    }

    /// Endpoint priority, overridden by a clipped `X-Gaming-Priority` header.
    #[must_use]
    pub fn classify_priority(&self, path: &str, priority_header: Option<&str>) -> u8 {
        if let Some(raw) = priority_header {
            if let Ok(explicit) = raw.trim().parse::<i64>() {
                return u8::try_from(explicit.clamp(0, 10)).unwrap_or(10);
            }
        }
        endpoint_priority(path)
    }

    /// Begin observing a request; the observation carries the id and
    /// priority for the response headers.
    pub fn begin(&self, path: &str, priority_header: Option<&str>) -> ResponseObservation {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        ResponseObservation {
            request_id: self.request_id(),
            priority: self.classify_priority(path, priority_header),
            started: Instant::now(),
        }
    }

    /// Record a finished response: status, cache participation, and the
    /// compression saving if [`maybe_compress`](Self::maybe_compress) ran.
    pub fn complete(
        &self,
        observation: &ResponseObservation,
        status: u16,
        served_from_cache: bool,
        compression_saved: Option<usize>,
    ) {
        let c = &self.counters;
        c.responses.fetch_add(1, Ordering::Relaxed);
        let millis = u64::try_from(observation.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        c.response_millis.fetch_add(millis, Ordering::Relaxed);
        if served_from_cache {
            c.cached_responses.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(saved) = compression_saved {
            c.compressed_responses.fetch_add(1, Ordering::Relaxed);
            c.compression_saved_bytes
                .fetch_add(saved as u64, Ordering::Relaxed);
        }
        match status {
            200..=299 => c.status_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => c.status_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => c.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    /// gzip a text-like body at level 6 once it crosses the threshold.
    /// Returns `None` when compression does not apply or does not help.
    #[must_use]
    pub fn maybe_compress(&self, content_type: &str, body: &[u8]) -> Option<Vec<u8>> {
        if body.len() < self.cfg.compression_threshold || !is_text_like(content_type) {
            return None;
        }
        let packed = gzip(body, self.cfg.compression_level).ok()?;
        (packed.len() < body.len()).then_some(packed)
    }

    /// Standard security headers attached to every response.
    #[must_use]
    pub fn security_headers(&self) -> Vec<(String, String)> {
        vec![
            ("X-Content-Type-Options".to_string(), "nosniff".to_string()),
            ("X-Frame-Options".to_string(), "DENY".to_string()),
            ("Referrer-Policy".to_string(), "same-origin".to_string()),
        ]
    }

    /// CORS headers for a request `Origin`. Same-origin by default: only
    /// origins on the allow-list receive `Access-Control-*` headers.
    #[must_use]
    pub fn cors_headers(&self, origin: Option<&str>) -> Vec<(String, String)> {
        let Some(origin) = origin else {
            return Vec::new();
        };
        if !self.cfg.cors_origins.iter().any(|allowed| allowed == origin) {
            return Vec::new();
        }
        vec![
            (
                "Access-Control-Allow-Origin".to_string(),
                origin.to_string(),
            ),
            (
                "Access-Control-Allow-Credentials".to_string(),
                "true".to_string(),
            ),
            ("Vary".to_string(), "Origin".to_string()),
        ]
    }

    /// Additional headers for an OPTIONS preflight; cached for 24 hours.
    #[must_use]
    pub fn preflight_headers(&self, origin: Option<&str>) -> Vec<(String, String)> {
        let mut headers = self.cors_headers(origin);
        if headers.is_empty() {
            return headers;
        }
        headers.push((
            "Access-Control-Allow-Methods".to_string(),
            "GET, POST, PUT, DELETE, OPTIONS".to_string(),
        ));
        headers.push((
            "Access-Control-Allow-Headers".to_string(),
            "Content-Type, Authorization, X-Gaming-Priority".to_string(),
        ));
        headers.push(("Access-Control-Max-Age".to_string(), "86400".to_string()));
        headers
    }

    /// Run `handler` deduplicated when the request qualifies; otherwise run
    /// it directly as an originator.
    pub async fn run_deduplicated<F, Fut>(
        &self,
        key: DedupKey,
        deadline: Option<Instant>,
        handler: F,
    ) -> Result<(Arc<SharedResponse>, DedupRole)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SharedResponse>>,
    {
        if self.cfg.enable_deduplication && key.method == "GET" {
            self.dedup.execute(key, deadline, handler).await
        } else {
            let response = Arc::new(handler().await?);
            Ok((response, DedupRole::Originator))
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        let c = &self.counters;
        let responses = c.responses.load(Ordering::Relaxed);
        OptimizerStats {
            requests: c.requests.load(Ordering::Relaxed),
            responses,
            cached_responses: c.cached_responses.load(Ordering::Relaxed),
            avg_response_millis: if responses > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    c.response_millis.load(Ordering::Relaxed) as f64 / responses as f64
                }
            } else {
                0.0
            },
            compressed_responses: c.compressed_responses.load(Ordering::Relaxed),
            compression_saved_bytes: c.compression_saved_bytes.load(Ordering::Relaxed),
            status_2xx: c.status_2xx.load(Ordering::Relaxed),
            status_4xx: c.status_4xx.load(Ordering::Relaxed),
            status_5xx: c.status_5xx.load(Ordering::Relaxed),
            dedup: self.dedup.stats(),
        }
    }
}
