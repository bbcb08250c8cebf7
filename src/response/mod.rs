//! Full HTTP response memoization with conditional serving.
//!
//! The embedder calls [`ResponseCache::try_serve`] before invoking a
//! handler and [`ResponseCache::store`] after the response has been sent.
//! Both ends are result values, never errors: an uncacheable request is a
//! `Miss`, an uncacheable response is a `Skipped`, and the HTTP mapping
//! stays with the embedder.

mod entry;
mod warming;

pub use entry::{ResponseEntry, compute_etag, http_date, parse_http_date};
pub use warming::{WarmFetcher, WarmTarget, WarmingQueue, WarmingStats, spawn_warmer};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, warn};

use crate::compress::{gzip, is_text_like};
use crate::config::ResponseCacheConfig;
use crate::error::Result;
use crate::keys::{Namespace, Principal, canonical_query};
use crate::manager::{CacheManager, GetOptions, SetOptions};
use crate::traits::Codec;

/// A request as seen by the cache: method, route, canonical query,
/// principal, and the conditional/cache-control headers the cache consumes.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub principal: Principal,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
    pub cache_control: Option<String>,
    /// Per-request deadline honoured at suspension points downstream.
    pub deadline: Option<Instant>,
}

impl CacheRequest {
    /// A GET request for `path` from the anonymous principal.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            query: Vec::new(),
            principal: Principal::Anonymous,
            if_none_match: None,
            if_modified_since: None,
            cache_control: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into().to_ascii_uppercase();
        self
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

    #[must_use]
    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    #[must_use]
    pub fn with_if_modified_since(mut self, date: impl Into<String>) -> Self {
        self.if_modified_since = Some(date.into());
        self
    }

    #[must_use]
    pub fn with_cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sorted, stable query string.
    #[must_use]
    pub fn canonical_query(&self) -> String {
        canonical_query(&self.query)
    }

    /// The logical cache key tail for this request.
    #[must_use]
    pub fn logical_key(&self) -> String {
        let cq = self.canonical_query();
        if cq.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, cq)
        }
    }

    fn requests_no_cache(&self) -> bool {
        let header_no_cache = self
            .cache_control
            .as_deref()
            .is_some_and(|cc| cc.to_ascii_lowercase().contains("no-cache"));
        let param_no_cache = self
            .query
            .iter()
            .any(|(k, v)| k == "nocache" && v == "true");
        header_no_cache || param_no_cache
    }
}

/// An upstream handler's response, ready for the cache write path.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
}

impl UpstreamResponse {
    #[must_use]
    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.into(),
        }
    }
}

/// A response served from the cache.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ServedResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone)]
pub enum ServeOutcome {
    /// A cached response (full body, or a 304 with `X-Cache: HIT-304`).
    Served(ServedResponse),
    /// Nothing usable cached; the embedder runs the handler.
    Miss,
}

/// Why a response write was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnsafeMethod,
    NonCacheableStatus,
    NoCacheRequested,
    PrivateEndpoint,
    TooLarge,
}

/// Outcome of a cache write.
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// Entry written; the headers belong on the outgoing MISS response.
    Stored { headers: Vec<(String, String)> },
    Skipped(SkipReason),
}

#[derive(Default)]
struct ResponseCounters {
    hits: AtomicU64,
    not_modified: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    stores: AtomicU64,
    skips: AtomicU64,
    compressed_entries: AtomicU64,
}

/// Snapshot of response-cache counters.
#[derive(Debug, Clone)]
pub struct ResponseCacheStats {
    pub hits: u64,
    pub not_modified: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub stores: u64,
    pub skips: u64,
    pub compressed_entries: u64,
}

/// Memoizes whole responses for safe methods.
pub struct ResponseCache<C: Codec = crate::codec::JsonCodec> {
    manager: CacheManager<C>,
    cfg: ResponseCacheConfig,
    warming: Arc<WarmingQueue>,
    counters: ResponseCounters,
}

impl<C: Codec + 'static> ResponseCache<C> {
    #[must_use]
    pub fn new(manager: CacheManager<C>, cfg: ResponseCacheConfig) -> Self {
        let warming = Arc::new(WarmingQueue::new(cfg.warming_queue_capacity));
        Self {
            manager,
            cfg,
            warming,
            counters: ResponseCounters::default(),
        }
    }

    #[must_use]
    pub fn warming(&self) -> &Arc<WarmingQueue> {
        &self.warming
    }

    #[must_use]
    pub fn warming_concurrency(&self) -> usize {
        self.cfg.warming_concurrency
    }

    /// Map a route to its keyspace namespace. Closed table.
    #[must_use]
    pub fn namespace_for(path: &str) -> Namespace {
        if path.contains("/voting") {
            Namespace::Voting
        } else if path.contains("/leaderboard") {
            Namespace::Leaderboard
        } else if path.contains("/clan") {
            Namespace::Clan
        } else if path.contains("/user") {
            Namespace::User
        } else if path.contains("/content") {
            Namespace::Content
        } else if path.contains("/tournament") {
            Namespace::Tournament
        } else if path.contains("/static") {
            Namespace::Static
        } else {
            Namespace::General
        }
    }

    /// Endpoints never memoized regardless of the rest of the predicate.
    #[must_use]
    pub fn is_private_endpoint(path: &str) -> bool {
        path.contains("admin") || path.contains("private") || path.contains("auth/me")
    }

    /// TTL precedence: explicit caller TTL, endpoint pattern, namespace
    /// default, global default.
    #[must_use]
    pub fn ttl_for(&self, path: &str, explicit: Option<std::time::Duration>) -> std::time::Duration {
        use std::time::Duration;
        if let Some(ttl) = explicit {
            return ttl;
        }
        if path.contains("/voting") {
            return Duration::from_secs(5);
        }
        if path.contains("/leaderboard") {
            return Duration::from_secs(30);
        }
        if path.contains("/clan") && path.contains("stats") {
            return Duration::from_secs(120);
        }
        if path.contains("/user") && (path.contains("profile") || path.contains("stats")) {
            return Duration::from_secs(300);
        }
        if path.contains("/static") {
            return Duration::from_secs(3600);
        }
        if path.contains("live") || path.contains("realtime") {
            return Duration::from_secs(60);
        }
        Self::namespace_for(path).default_ttl()
    }

    fn serveable(&self, req: &CacheRequest) -> bool {
        req.method == "GET" && !req.requests_no_cache() && !Self::is_private_endpoint(&req.path)
    }

    /// Look up a memoized response for `req`.
    ///
    /// Never errors on store trouble: degraded reads surface as `Miss`.
    pub async fn try_serve(&self, req: &CacheRequest) -> Result<ServeOutcome> {
        if !self.serveable(req) {
            self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
            return Ok(ServeOutcome::Miss);
        }

        let namespace = Self::namespace_for(&req.path);
        let logical = req.logical_key();
        let entry: Option<ResponseEntry> = self
            .manager
            .get(namespace, &req.principal, &logical, GetOptions::default())
            .await?;

        let Some(entry) = entry else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(ServeOutcome::Miss);
        };

        let now = Utc::now().timestamp();
        if entry.is_expired(now) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(ServeOutcome::Miss);
        }

        if self.cfg.enable_conditional_caching {
            let etag_hit = req
                .if_none_match
                .as_deref()
                .is_some_and(|inm| entry.etag_matches(inm));
            let date_hit = !etag_hit
                && req.if_none_match.is_none()
                && req
                    .if_modified_since
                    .as_deref()
                    .is_some_and(|ims| entry.not_modified_since(ims));

            if etag_hit || date_hit {
                self.counters.not_modified.fetch_add(1, Ordering::Relaxed);
                let headers = self.hit_headers(&entry, "HIT-304", now);
                return Ok(ServeOutcome::Served(ServedResponse {
                    status: 304,
                    headers,
                    body: Bytes::new(),
                }));
            }
        }

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        let headers = self.hit_headers(&entry, "HIT", now);
        debug!(path = %req.path, "response served from cache");
        Ok(ServeOutcome::Served(ServedResponse {
            status: entry.status,
            headers,
            body: entry.body_bytes(),
        }))
    }

    /// Write a handler response through the caching predicate. Idempotent;
    /// a failed predicate is a silent skip.
    pub async fn store(
        &self,
        req: &CacheRequest,
        response: &UpstreamResponse,
        explicit_ttl: Option<std::time::Duration>,
    ) -> Result<StoreOutcome> {
        let outcome = self.store_inner(req, response, explicit_ttl).await?;
        match &outcome {
            StoreOutcome::Stored { .. } => {
                self.counters.stores.fetch_add(1, Ordering::Relaxed);
            }
            StoreOutcome::Skipped(reason) => {
                self.counters.skips.fetch_add(1, Ordering::Relaxed);
                debug!(path = %req.path, ?reason, "response not cached");
            }
        }
        Ok(outcome)
    }

    async fn store_inner(
        &self,
        req: &CacheRequest,
        response: &UpstreamResponse,
        explicit_ttl: Option<std::time::Duration>,
    ) -> Result<StoreOutcome> {
        if req.method != "GET" {
            return Ok(StoreOutcome::Skipped(SkipReason::UnsafeMethod));
        }
        if response.status != 200 {
            return Ok(StoreOutcome::Skipped(SkipReason::NonCacheableStatus));
        }
        if req.requests_no_cache() {
            return Ok(StoreOutcome::Skipped(SkipReason::NoCacheRequested));
        }
        if Self::is_private_endpoint(&req.path) {
            return Ok(StoreOutcome::Skipped(SkipReason::PrivateEndpoint));
        }
        if response.body.len() > self.cfg.max_response_size {
            warn!(
                path = %req.path,
                size = response.body.len(),
                limit = self.cfg.max_response_size,
                "response too large to cache"
            );
            return Ok(StoreOutcome::Skipped(SkipReason::TooLarge));
        }

        let etag = compute_etag(&response.body);
        let (body, compressed) = self.encode_body(&response.content_type, &response.body);
        if compressed {
            self.counters.compressed_entries.fetch_add(1, Ordering::Relaxed);
        }

        let namespace = Self::namespace_for(&req.path);
        let ttl = self.ttl_for(&req.path, explicit_ttl);
        let now = Utc::now().timestamp();
        let entry = ResponseEntry {
            body,
            compressed,
            status: response.status,
            content_type: response.content_type.clone(),
            etag,
            last_modified: now,
            created_at: now,
            expires_at: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
            ttl_secs: ttl.as_secs(),
            origin_namespace: namespace,
            origin_endpoint: req.path.clone(),
        };

        let logical = req.logical_key();
        self.manager
            .set(
                namespace,
                &req.principal,
                &logical,
                &entry,
                SetOptions {
                    ttl: Some(ttl),
                    version: None,
                },
            )
            .await?;

        Ok(StoreOutcome::Stored {
            headers: self.miss_headers(&entry),
        })
    }

    fn encode_body(&self, content_type: &str, body: &[u8]) -> (Vec<u8>, bool) {
        if self.cfg.enable_compression
            && body.len() >= self.cfg.compression_threshold
            && is_text_like(content_type)
        {
            if let Ok(packed) = gzip(body, self.cfg.compression_level) {
                if packed.len() < body.len() {
                    return (packed, true);
                }
            }
        }
        (body.to_vec(), false)
    }

    fn hit_headers(&self, entry: &ResponseEntry, cache_status: &str, now: i64) -> Vec<(String, String)> {
        let mut headers = vec![
            ("ETag".to_string(), format!("\"{}\"", entry.etag)),
            ("Last-Modified".to_string(), http_date(entry.last_modified)),
            (
                "Cache-Control".to_string(),
                format!("max-age={}", entry.ttl_secs),
            ),
            ("X-Cache".to_string(), cache_status.to_string()),
            (
                "X-Cache-TTL".to_string(),
                entry.remaining_secs(now).to_string(),
            ),
        ];
        if cache_status != "HIT-304" {
            headers.push(("Content-Type".to_string(), entry.content_type.clone()));
            if entry.compressed {
                headers.push(("Content-Encoding".to_string(), "gzip".to_string()));
                // Encoding varies with the request only for compressed entries.
                headers.push(("Vary".to_string(), "Accept-Encoding".to_string()));
            }
        }
        headers
    }

    fn miss_headers(&self, entry: &ResponseEntry) -> Vec<(String, String)> {
        vec![
            ("ETag".to_string(), format!("\"{}\"", entry.etag)),
            ("Last-Modified".to_string(), http_date(entry.last_modified)),
            (
                "Cache-Control".to_string(),
                format!("max-age={}", entry.ttl_secs),
            ),
            ("X-Cache".to_string(), "MISS".to_string()),
            ("X-Cache-TTL".to_string(), entry.ttl_secs.to_string()),
        ]
    }

    pub fn stats(&self) -> ResponseCacheStats {
        let c = &self.counters;
        ResponseCacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            not_modified: c.not_modified.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            bypasses: c.bypasses.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            skips: c.skips.load(Ordering::Relaxed),
            compressed_entries: c.compressed_entries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::{MemoryStore, TieredStore};

    fn cache() -> ResponseCache {
        let store = Arc::new(TieredStore::new(
            Arc::new(MemoryStore::new()),
            StoreConfig::default(),
        ));
        ResponseCache::new(CacheManager::new(store), ResponseCacheConfig::default())
    }

    #[test]
    fn namespace_mapping_is_closed() {
        assert_eq!(
            ResponseCache::<crate::codec::JsonCodec>::namespace_for("/api/voting/results/C1"),
            Namespace::Voting
        );
        assert_eq!(
            ResponseCache::<crate::codec::JsonCodec>::namespace_for("/api/leaderboard/users"),
            Namespace::Leaderboard
        );
        assert_eq!(
            ResponseCache::<crate::codec::JsonCodec>::namespace_for("/healthz"),
            Namespace::General
        );
    }

    #[tokio::test]
    async fn post_requests_are_never_written() {
        let cache = cache();
        let req = CacheRequest::get("/api/user/profile/U1").with_method("POST");
        let resp = UpstreamResponse::json(200, "{}");
        let outcome = cache.store(&req, &resp, None).await.unwrap();
        assert!(matches!(
            outcome,
            StoreOutcome::Skipped(SkipReason::UnsafeMethod)
        ));
    }

    #[tokio::test]
    async fn error_statuses_bypass_the_write() {
        let cache = cache();
        let req = CacheRequest::get("/api/user/profile/U1");
        for status in [404u16, 500] {
            let outcome = cache
                .store(&req, &UpstreamResponse::json(status, "{}"), None)
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                StoreOutcome::Skipped(SkipReason::NonCacheableStatus)
            ));
        }
    }

    #[tokio::test]
    async fn no_cache_header_and_param_bypass() {
        let cache = cache();
        let with_header =
            CacheRequest::get("/api/content/trending").with_cache_control("no-cache");
        assert!(matches!(
            cache
                .store(&with_header, &UpstreamResponse::json(200, "{}"), None)
                .await
                .unwrap(),
            StoreOutcome::Skipped(SkipReason::NoCacheRequested)
        ));

        let with_param = CacheRequest::get("/api/content/trending").with_query("nocache", "true");
        assert!(matches!(
            cache
                .store(&with_param, &UpstreamResponse::json(200, "{}"), None)
                .await
                .unwrap(),
            StoreOutcome::Skipped(SkipReason::NoCacheRequested)
        ));
    }

    #[tokio::test]
    async fn private_endpoints_are_skipped() {
        let cache = cache();
        for path in ["/api/admin/users", "/api/private/keys", "/api/auth/me"] {
            let outcome = cache
                .store(
                    &CacheRequest::get(path),
                    &UpstreamResponse::json(200, "{}"),
                    None,
                )
                .await
                .unwrap();
            assert!(matches!(
                outcome,
                StoreOutcome::Skipped(SkipReason::PrivateEndpoint)
            ));
        }
    }

    #[tokio::test]
    async fn oversized_bodies_are_skipped() {
        let store = Arc::new(TieredStore::new(
            Arc::new(MemoryStore::new()),
            StoreConfig::default(),
        ));
        let mut cfg = ResponseCacheConfig::default();
        cfg.max_response_size = 128;
        let cache = ResponseCache::new(CacheManager::new(store), cfg);

        let req = CacheRequest::get("/api/content/trending");
        let resp = UpstreamResponse::json(200, vec![b'x'; 256]);
        assert!(matches!(
            cache.store(&req, &resp, None).await.unwrap(),
            StoreOutcome::Skipped(SkipReason::TooLarge)
        ));
    }

    #[tokio::test]
    async fn ttl_precedence_follows_the_table() {
        use std::time::Duration;
        let cache = cache();
        assert_eq!(
            cache.ttl_for("/api/voting/results/C1", None),
            Duration::from_secs(5)
        );
        assert_eq!(
            cache.ttl_for("/api/leaderboard/users", None),
            Duration::from_secs(30)
        );
        assert_eq!(
            cache.ttl_for("/api/clan/stats/K1", None),
            Duration::from_secs(120)
        );
        assert_eq!(
            cache.ttl_for("/api/user/profile/U1", None),
            Duration::from_secs(300)
        );
        assert_eq!(cache.ttl_for("/static/app.js", None), Duration::from_secs(3600));
        assert_eq!(
            cache.ttl_for("/api/matches/live", None),
            Duration::from_secs(60)
        );
        assert_eq!(
            cache.ttl_for("/api/voting/results/C1", Some(Duration::from_secs(99))),
            Duration::from_secs(99)
        );
    }
}
