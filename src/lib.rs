//! Server-side performance backbone for the MLG.clan platform.
//!
//! Every request flows through the same pipeline:
//!
//! ```text
//! request → RequestOptimizer → ResponseCache (read) → handler → ResponseCache (write)
//!                 │                    │                   │
//!                 ▼                    ▼                   ▼
//!          dedup / batching     CacheManager ← InvalidationBus ← domain events
//!                                      │
//!                                 TieredStore (L1 moka + shared store)
//!
//!          QueryPerfMonitor observes DB calls on the side
//! ```
//!
//! The crate is a library: the embedding process owns the HTTP framework
//! and maps [`ServeOutcome`] / [`StoreOutcome`] to its own response types.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mlg_backbone::{Backbone, BackboneConfig, CacheRequest, ServeOutcome, UpstreamResponse};
//!
//! #[tokio::main]
//! async fn main() -> mlg_backbone::Result<()> {
//!     let backbone = Backbone::new(BackboneConfig::default()).await?;
//!
//!     let request = CacheRequest::get("/api/leaderboard/users").with_query("limit", "50");
//!     match backbone.try_serve_from_cache(&request).await? {
//!         ServeOutcome::Served(response) => {
//!             // write response.status / headers / body to the client
//!             let _ = response;
//!         }
//!         ServeOutcome::Miss => {
//!             let response = UpstreamResponse::json(200, "[]"); // run the real handler
//!             backbone.write_to_cache(&request, &response).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Failure policy: reads fail open, writes and invalidations fail quiet. A
//! shared-store outage degrades every request to the uncached path; only
//! caller deadlines ever surface as errors.

pub mod codec;
mod compress;
pub mod config;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod keys;
pub mod manager;
pub mod monitor;
pub mod optimizer;
pub mod response;
pub mod store;
pub mod traits;

pub use codec::JsonCodec;
pub use config::{
    BackboneConfig, InvalidationConfig, MonitorConfig, OptimizerConfig, ResponseCacheConfig,
    StoreConfig,
};
pub use error::{BackboneError, Result};
pub use events::{DomainEvent, EventKind};
pub use invalidation::{InvalidationBus, InvalidationStats};
pub use keys::{Namespace, Principal};
pub use manager::{CacheManager, GetOptions, ManagerStats, SetOptions};
pub use monitor::{MonitorEvent, MonitorStats, QueryContext, QueryPerfMonitor};
pub use optimizer::{DedupKey, DedupRole, RequestOptimizer, SharedResponse};
pub use response::{
    CacheRequest, ResponseCache, ServeOutcome, ServedResponse, StoreOutcome, UpstreamResponse,
    WarmFetcher, WarmTarget,
};
pub use store::{MemoryStore, TieredStore};
pub use traits::{Codec, RemoteStore};

#[cfg(feature = "redis")]
pub use store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

/// The wired pipeline: one instance per process, passed by reference into
/// request handling. Construction is explicit; there are no globals.
pub struct Backbone<C: Codec = JsonCodec> {
    manager: CacheManager<C>,
    responses: Arc<ResponseCache<C>>,
    bus: InvalidationBus<C>,
    optimizer: Arc<RequestOptimizer>,
    monitor: QueryPerfMonitor,
    shutdown_tx: broadcast::Sender<()>,
}

impl Backbone<JsonCodec> {
    /// Connect to the shared store named by `REDIS_URL` and wire every
    /// component with `cfg`.
    ///
    /// # Errors
    ///
    /// Returns an error when the shared store is unreachable at startup.
    #[cfg(feature = "redis")]
    pub async fn new(cfg: BackboneConfig) -> Result<Self> {
        let remote: Arc<dyn RemoteStore> = Arc::new(RedisStore::new().await?);
        Ok(Self::with_store(cfg, remote))
    }

    /// Wire the pipeline over an already-constructed remote store. This is
    /// the entry point for test doubles and single-node deployments.
    #[must_use]
    pub fn with_store(cfg: BackboneConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self::with_store_and_codec(cfg, remote, JsonCodec)
    }
}

impl<C: Codec + 'static> Backbone<C> {
    /// Fully explicit construction with a custom codec.
    #[must_use]
    pub fn with_store_and_codec(cfg: BackboneConfig, remote: Arc<dyn RemoteStore>, codec: C) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        let store = Arc::new(TieredStore::new(remote, cfg.store));
        let manager = CacheManager::with_codec(store, codec);
        let responses = Arc::new(ResponseCache::new(manager.clone(), cfg.response));
        let bus = InvalidationBus::start(manager.clone(), cfg.invalidation);
        let optimizer = Arc::new(RequestOptimizer::new(
            cfg.optimizer,
            shutdown_tx.subscribe(),
        ));
        let monitor = QueryPerfMonitor::start(cfg.monitor);

        info!("performance backbone initialized");
        Self {
            manager,
            responses,
            bus,
            optimizer,
            monitor,
            shutdown_tx,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &CacheManager<C> {
        &self.manager
    }

    #[must_use]
    pub fn responses(&self) -> &Arc<ResponseCache<C>> {
        &self.responses
    }

    #[must_use]
    pub fn invalidation(&self) -> &InvalidationBus<C> {
        &self.bus
    }

    #[must_use]
    pub fn optimizer(&self) -> &Arc<RequestOptimizer> {
        &self.optimizer
    }

    #[must_use]
    pub fn monitor(&self) -> &QueryPerfMonitor {
        &self.monitor
    }

    /// Serve `request` from the response cache if possible.
    ///
    /// # Errors
    ///
    /// Only deadline and codec-boundary failures surface; store trouble
    /// reads as a `Miss`.
    pub async fn try_serve_from_cache(&self, request: &CacheRequest) -> Result<ServeOutcome> {
        self.responses.try_serve(request).await
    }

    /// Memoize a handler response. Idempotent; a failed predicate is a
    /// silent skip.
    ///
    /// # Errors
    ///
    /// Only codec-boundary failures surface; store trouble is a quiet drop.
    pub async fn write_to_cache(
        &self,
        request: &CacheRequest,
        response: &UpstreamResponse,
    ) -> Result<StoreOutcome> {
        self.responses.store(request, response, None).await
    }

    /// Enqueue a domain event for invalidation. Non-blocking.
    pub fn emit_event(&self, event: DomainEvent) {
        self.bus.emit(event);
    }

    /// Record a DB call for the performance monitor. Non-blocking.
    pub fn record_query(&self, sql: &str, params: &[&str], exec: Duration, ctx: QueryContext) {
        self.monitor.record(sql, params, exec, ctx);
    }

    /// Start the cache-warming drainer with the embedder's fetcher.
    pub fn spawn_warmer(&self, fetcher: Arc<dyn WarmFetcher>) -> tokio::task::JoinHandle<()> {
        response::spawn_warmer(
            Arc::clone(&self.responses),
            fetcher,
            self.responses.warming_concurrency(),
            self.shutdown_tx.subscribe(),
        )
    }

    /// `true` while the pipeline can serve (L1 always; the shared store is
    /// allowed to be degraded).
    pub async fn health_check(&self) -> bool {
        self.manager.store().health_check().await
    }

    /// Drain pending invalidations (bounded) and stop background tasks.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.bus.shutdown().await;
        self.monitor.shutdown();
        info!("performance backbone shut down");
    }
}

/// Builder over [`Backbone`] for swapping the remote store or codec.
pub struct BackboneBuilder {
    cfg: BackboneConfig,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl BackboneBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cfg: BackboneConfig::default(),
            remote: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, cfg: BackboneConfig) -> Self {
        self.cfg = cfg;
        self
    }

    #[must_use]
    pub fn with_remote_store(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Build the backbone. Without an explicit remote store the default
    /// backend connects to Redis (feature `redis`); with the feature off an
    /// in-process [`MemoryStore`] is used.
    ///
    /// # Errors
    ///
    /// Returns an error when the default shared store cannot be reached.
    pub async fn build(self) -> Result<Backbone> {
        if let Some(remote) = self.remote {
            return Ok(Backbone::with_store(self.cfg, remote));
        }
        #[cfg(feature = "redis")]
        {
            Backbone::new(self.cfg).await
        }
        #[cfg(not(feature = "redis"))]
        {
            Ok(Backbone::with_store(self.cfg, Arc::new(MemoryStore::new())))
        }
    }
}

impl Default for BackboneBuilder {
    fn default() -> Self {
        Self::new()
    }
}
