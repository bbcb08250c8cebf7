//! Whole-pipeline integration: miss/store/hit/invalidate flow, warming,
//! degraded operation during a store outage, and optimizer services.

mod common;

use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mlg_backbone::response::{WarmFetcher, WarmTarget};
use mlg_backbone::{
    CacheRequest, DomainEvent, Result, ServeOutcome, StoreOutcome, UpstreamResponse,
};

#[tokio::test]
async fn request_lifecycle_miss_hit_invalidate_miss() {
    let (_, backbone) = test_backbone();
    let request = CacheRequest::get("/api/voting/results/C42");

    assert!(matches!(
        backbone.try_serve_from_cache(&request).await.unwrap(),
        ServeOutcome::Miss
    ));

    backbone
        .write_to_cache(&request, &UpstreamResponse::json(200, "{\"votes\":12}"))
        .await
        .unwrap();
    assert!(matches!(
        backbone.try_serve_from_cache(&request).await.unwrap(),
        ServeOutcome::Served(_)
    ));

    backbone.emit_event(DomainEvent::VoteCast {
        user_id: "U7".into(),
        content_id: "C42".into(),
        clan_id: Some("K1".into()),
    });
    backbone.invalidation().flush_now().await;

    assert!(matches!(
        backbone.try_serve_from_cache(&request).await.unwrap(),
        ServeOutcome::Miss
    ));
}

#[tokio::test]
async fn store_outage_degrades_without_handler_failures() {
    let (remote, backbone) = test_backbone();
    let request = CacheRequest::get("/api/leaderboard/users");

    remote.set_offline(true);

    // Reads degrade to misses, writes are quiet no-ops; nothing errors.
    assert!(matches!(
        backbone.try_serve_from_cache(&request).await.unwrap(),
        ServeOutcome::Miss
    ));
    let outcome = backbone
        .write_to_cache(&request, &UpstreamResponse::json(200, "[]"))
        .await
        .unwrap();
    assert!(matches!(outcome, StoreOutcome::Stored { .. } | StoreOutcome::Skipped(_)));

    // L1 keeps the pipeline healthy.
    assert!(backbone.health_check().await);
}

struct CountingFetcher {
    calls: AtomicU32,
}

#[async_trait]
impl WarmFetcher for CountingFetcher {
    async fn fetch(&self, target: &WarmTarget) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamResponse::json(
            200,
            format!("{{\"warmed\":\"{}\"}}", target.endpoint),
        ))
    }
}

#[tokio::test]
async fn warming_populates_the_cache_before_any_request() {
    let (_, backbone) = test_backbone();
    let fetcher = Arc::new(CountingFetcher {
        calls: AtomicU32::new(0),
    });
    let _drainer = backbone.spawn_warmer(fetcher.clone());

    backbone
        .responses()
        .warming()
        .enqueue(WarmTarget::new("/api/leaderboard/users", 8));

    let warmed = wait_for(
        || backbone.responses().warming().stats().warmed >= 1,
        2_000,
    )
    .await;
    assert!(warmed, "warm target not processed");
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // The synthetic GET landed in the cache; a real request now hits.
    let request = CacheRequest::get("/api/leaderboard/users");
    match backbone.try_serve_from_cache(&request).await.unwrap() {
        ServeOutcome::Served(served) => {
            assert_eq!(served.header("X-Cache"), Some("HIT"));
        }
        ServeOutcome::Miss => panic!("warmed endpoint should hit"),
    }
}

#[tokio::test]
async fn optimizer_observation_feeds_response_headers() {
    let (_, backbone) = test_backbone();
    let optimizer = backbone.optimizer();

    let observation = optimizer.begin("/api/voting/results/C1", None);
    assert_eq!(observation.priority, 10);
    assert!(observation.request_id.starts_with("req_"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let response_time = format!("{}ms", observation.elapsed_millis());
    assert!(response_time.ends_with("ms"));

    optimizer.complete(&observation, 200, true, None);
    let stats = optimizer.stats();
    assert_eq!(stats.responses, 1);
    assert_eq!(stats.cached_responses, 1);
    assert_eq!(stats.status_2xx, 1);
    assert!(stats.avg_response_millis >= 15.0);
}

#[tokio::test]
async fn compressed_responses_report_savings() {
    let (_, backbone) = test_backbone();
    let optimizer = backbone.optimizer();

    let body = json_body(8);
    let packed = optimizer
        .maybe_compress("application/json", &body)
        .expect("large JSON should compress");
    let saved = body.len() - packed.len();

    let observation = optimizer.begin("/api/leaderboard/users", None);
    optimizer.complete(&observation, 200, false, Some(saved));

    let stats = optimizer.stats();
    assert_eq!(stats.compressed_responses, 1);
    assert_eq!(stats.compression_saved_bytes, saved as u64);
}

#[tokio::test]
async fn session_data_flows_through_the_cache_manager() {
    use mlg_backbone::{GetOptions, Namespace, Principal, SetOptions};

    let (_, backbone) = test_backbone();
    let cache = backbone.cache();
    let principal = Principal::user("U7");

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Session {
        wallet: String,
        tier: u8,
    }

    let session = Session {
        wallet: "0xabc".into(),
        tier: 2,
    };
    cache
        .set(
            Namespace::Session,
            &principal,
            "session/U7",
            &session,
            SetOptions::default(),
        )
        .await
        .unwrap();

    let cached: Option<Session> = cache
        .get(Namespace::Session, &principal, "session/U7", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(cached, Some(session));

    let stats = cache.stats();
    assert_eq!(stats.sets, 1);
    assert!(stats.hit_rate > 0.0);
}
