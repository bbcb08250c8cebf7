//! Configuration surface for every backbone component.
//!
//! Each component carries its own config struct with defaults matching the
//! production deployment; [`BackboneConfig`] aggregates them for one-call
//! construction.

use std::time::Duration;

/// Configuration for the tiered KV store adapter (remote store + local L1).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Optional environment prefix prepended to every key (e.g. `prod`).
    pub env_prefix: Option<String>,
    /// Application prefix, second key segment.
    pub app_prefix: String,
    /// Fallback TTL when neither the caller nor the namespace supplies one.
    pub default_ttl: Duration,
    /// TTL for short-lived entries (realtime-adjacent data).
    pub short_ttl: Duration,
    /// TTL for long-lived entries (static data).
    pub long_ttl: Duration,
    /// Serialized values larger than this are gzip-compressed in the envelope.
    pub compression_threshold: usize,
    /// gzip level used for envelope compression.
    pub compression_level: u32,
    /// Max entries held by the in-process L1 tier.
    pub l1_max_capacity: u64,
    /// Ceiling applied to L1 TTLs; remote TTLs are clamped to this on repopulation.
    pub l1_max_ttl: Duration,
    /// Values larger than this are never admitted to L1.
    pub l1_max_entry_bytes: usize,
    /// Consecutive remote failures before the circuit opens.
    pub breaker_failure_threshold: u32,
    /// How long an open circuit short-circuits remote calls.
    pub breaker_cooldown: Duration,
    /// Page size used for cursor-based key scans and bounded batch deletes.
    pub scan_page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            env_prefix: None,
            app_prefix: "mlg".to_string(),
            default_ttl: Duration::from_secs(300),
            short_ttl: Duration::from_secs(60),
            long_ttl: Duration::from_secs(3600),
            compression_threshold: 1024,
            compression_level: 6,
            l1_max_capacity: 10_000,
            l1_max_ttl: Duration::from_secs(60),
            l1_max_entry_bytes: 64 * 1024,
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            scan_page_size: 100,
        }
    }
}

/// Configuration for the HTTP response cache.
#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Bodies larger than this are never cached.
    pub max_response_size: usize,
    /// Serve 304s for matching `If-None-Match` / `If-Modified-Since`.
    pub enable_conditional_caching: bool,
    /// gzip response bodies at or above the threshold.
    pub enable_compression: bool,
    /// Minimum body size for response-body compression.
    pub compression_threshold: usize,
    /// gzip level for response bodies.
    pub compression_level: u32,
    /// Capacity of the warming priority queue.
    pub warming_queue_capacity: usize,
    /// Concurrent warming fetches.
    pub warming_concurrency: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            max_response_size: 1024 * 1024,
            enable_conditional_caching: true,
            enable_compression: true,
            compression_threshold: 1024,
            compression_level: 6,
            warming_queue_capacity: 256,
            warming_concurrency: 5,
        }
    }
}

/// Configuration for the invalidation bus.
#[derive(Debug, Clone)]
pub struct InvalidationConfig {
    /// Master switch; when off, emitted events are dropped (and counted).
    pub enable_smart_invalidation: bool,
    /// Max merged events per batch before an early flush.
    pub invalidation_batch_size: usize,
    /// Flush delay for high-priority events (votes, tournament updates,
    /// leaderboard refreshes).
    pub invalidation_delay: Duration,
    /// Coalescing window for batchable events.
    pub batch_window: Duration,
    /// Per-action retry limit before dead-lettering.
    pub max_retries: u32,
    /// Base back-off; attempt `n` sleeps `retry_delay * n`.
    pub retry_delay: Duration,
    /// Reject duplicate events per entity inside the filter window.
    pub enable_event_filtering: bool,
    /// Duplicate-rejection window for high-frequency event sources.
    pub event_filter_window: Duration,
    /// Bounded dead-letter log capacity.
    pub dead_letter_capacity: usize,
    /// Hard ceiling for draining pending batches at shutdown.
    pub shutdown_drain_ceiling: Duration,
    /// When set, emit a `LeaderboardRefresh` event on this interval as a
    /// safety net on top of event-driven invalidation.
    pub leaderboard_refresh_interval: Option<Duration>,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            enable_smart_invalidation: true,
            invalidation_batch_size: 100,
            invalidation_delay: Duration::from_millis(50),
            batch_window: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
            enable_event_filtering: true,
            event_filter_window: Duration::from_secs(1),
            dead_letter_capacity: 1024,
            shutdown_drain_ceiling: Duration::from_secs(5),
            leaderboard_refresh_interval: None,
        }
    }
}

/// Configuration for the request optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Coalesce concurrent identical GETs.
    pub enable_deduplication: bool,
    /// Age limit for sharing an in-flight request's result.
    pub deduplication_window: Duration,
    /// Hold safe idempotent reads for batched dispatch.
    pub enable_batching: bool,
    /// Peers on one pattern that trigger a dispatch.
    pub batch_size: usize,
    /// Hold window before a batch dispatches.
    pub batch_window: Duration,
    /// Liveness ceiling: no request is held longer than this.
    pub max_batch_wait: Duration,
    /// gzip text-like response bodies at or above this size.
    pub compression_threshold: usize,
    /// gzip level for response compression.
    pub compression_level: u32,
    /// Allowed CORS origins; empty means same-origin only.
    pub cors_origins: Vec<String>,
    /// Keep-alive timeout advertised to the embedding server.
    pub keep_alive_timeout: Duration,
    /// Socket ceiling advertised to the embedding server.
    pub max_sockets: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_deduplication: true,
            deduplication_window: Duration::from_secs(1),
            enable_batching: false,
            batch_size: 10,
            batch_window: Duration::from_millis(100),
            max_batch_wait: Duration::from_millis(500),
            compression_threshold: 1024,
            compression_level: 6,
            cors_origins: Vec::new(),
            keep_alive_timeout: Duration::from_secs(65),
            max_sockets: 50,
        }
    }
}

/// Configuration for the query performance monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Probability of admitting a fast query; slow queries always pass.
    pub sampling_rate: f64,
    /// Fallback slow threshold for classes without a dedicated SLA.
    pub slow_query_threshold: Duration,
    /// Very-slow threshold, shared by all classes.
    pub very_slow_query_threshold: Duration,
    /// SLA threshold for voting queries.
    pub voting_query_threshold: Duration,
    /// SLA threshold for leaderboard queries.
    pub leaderboard_query_threshold: Duration,
    /// SLA threshold for tournament queries.
    pub tournament_query_threshold: Duration,
    /// Emit regression events when a query's mean degrades past the threshold.
    pub enable_regression_detection: bool,
    /// Fractional mean increase over baseline that counts as a regression.
    pub regression_threshold: f64,
    /// Slow queries within one window that trigger an alert.
    pub alert_threshold: u64,
    /// Sliding alert window.
    pub alert_window: Duration,
    /// Age past which recent/slow/suggestion records are evicted.
    pub retention_period: Duration,
    /// Recent-query ring capacity.
    pub max_stored_queries: usize,
    /// Bounded admit channel; records are dropped (and counted) when full.
    pub admit_channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 0.1,
            slow_query_threshold: Duration::from_millis(1000),
            very_slow_query_threshold: Duration::from_millis(5000),
            voting_query_threshold: Duration::from_millis(100),
            leaderboard_query_threshold: Duration::from_millis(500),
            tournament_query_threshold: Duration::from_millis(1000),
            enable_regression_detection: true,
            regression_threshold: 0.5,
            alert_threshold: 10,
            alert_window: Duration::from_secs(300),
            retention_period: Duration::from_secs(24 * 3600),
            max_stored_queries: 1000,
            admit_channel_capacity: 4096,
        }
    }
}

/// Aggregate configuration for one-call construction of the backbone.
#[derive(Debug, Clone, Default)]
pub struct BackboneConfig {
    pub store: StoreConfig,
    pub response: ResponseCacheConfig,
    pub invalidation: InvalidationConfig,
    pub optimizer: OptimizerConfig,
    pub monitor: MonitorConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let cfg = BackboneConfig::default();
        assert_eq!(cfg.store.compression_threshold, 1024);
        assert_eq!(cfg.store.scan_page_size, 100);
        assert_eq!(cfg.response.max_response_size, 1024 * 1024);
        assert_eq!(cfg.invalidation.max_retries, 3);
        assert_eq!(
            cfg.invalidation.invalidation_delay,
            Duration::from_millis(50)
        );
        assert_eq!(cfg.invalidation.batch_window, Duration::from_secs(1));
        assert_eq!(cfg.optimizer.batch_size, 10);
        assert_eq!(cfg.optimizer.max_batch_wait, Duration::from_millis(500));
        assert_eq!(cfg.monitor.alert_threshold, 10);
        assert_eq!(
            cfg.monitor.voting_query_threshold,
            Duration::from_millis(100)
        );
        assert!((cfg.monitor.sampling_rate - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn invalidation_defaults_are_off_for_the_refresh_timer() {
        let cfg = InvalidationConfig::default();
        assert!(cfg.leaderboard_refresh_interval.is_none());
        assert!(cfg.enable_event_filtering);
    }
}
