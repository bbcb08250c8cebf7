//! Deduplication integration: concurrent identical GETs collapse onto one
//! handler run and share the response.

mod common;

use common::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use mlg_backbone::optimizer::{DedupKey, DedupRole, SharedResponse};
use mlg_backbone::{CacheRequest, Principal};

fn clan_key() -> DedupKey {
    DedupKey::from_request(
        &CacheRequest::get("/api/clans/42").with_principal(Principal::user("U7")),
    )
}

#[tokio::test]
async fn hundred_concurrent_gets_invoke_the_handler_once() {
    let (_, backbone) = test_backbone();
    let optimizer = Arc::clone(backbone.optimizer());
    let handler_runs = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for i in 0..100u32 {
        let optimizer = Arc::clone(&optimizer);
        let runs = Arc::clone(&handler_runs);
        tasks.push(tokio::spawn(async move {
            // Spread arrivals over ~200 ms, all inside the 1 s window.
            tokio::time::sleep(Duration::from_millis(u64::from(i % 20) * 10)).await;
            optimizer
                .run_deduplicated(clan_key(), None, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    Ok(SharedResponse {
                        status: 200,
                        headers: vec![("Content-Type".into(), "application/json".into())],
                        body: Bytes::from_static(b"{\"clan\":42,\"members\":17}"),
                    })
                })
                .await
        }));
    }

    let mut originators = 0;
    let mut deduplicated = 0;
    let mut bodies = Vec::new();
    for task in tasks {
        let (response, role) = task.await.unwrap().unwrap();
        bodies.push(response.body.clone());
        match role {
            DedupRole::Originator => originators += 1,
            DedupRole::Deduplicated => deduplicated += 1,
        }
    }

    assert_eq!(handler_runs.load(Ordering::SeqCst), 1, "one handler run");
    assert_eq!(originators, 1, "exactly one X-Cache: MISS");
    assert_eq!(deduplicated, 99, "99 X-Cache: HIT-DEDUPLICATED");
    let first = bodies.first().unwrap();
    assert!(bodies.iter().all(|b| b == first), "byte-identical responses");
}

#[tokio::test]
async fn different_principals_never_share_results() {
    let (_, backbone) = test_backbone();
    let optimizer = Arc::clone(backbone.optimizer());
    let handler_runs = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for user in ["U1", "U2"] {
        let optimizer = Arc::clone(&optimizer);
        let runs = Arc::clone(&handler_runs);
        let key = DedupKey::from_request(
            &CacheRequest::get("/api/user/profile/me").with_principal(Principal::user(user)),
        );
        tasks.push(tokio::spawn(async move {
            optimizer
                .run_deduplicated(key, None, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(SharedResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: Bytes::from_static(b"{}"),
                    })
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(handler_runs.load(Ordering::SeqCst), 2, "one run per principal");
}

#[tokio::test]
async fn non_get_requests_bypass_deduplication() {
    let (_, backbone) = test_backbone();
    let optimizer = Arc::clone(backbone.optimizer());
    let handler_runs = Arc::new(AtomicU32::new(0));

    let mut key = clan_key();
    key.method = "POST".to_string();

    for _ in 0..3 {
        let runs = Arc::clone(&handler_runs);
        let (_, role) = optimizer
            .run_deduplicated(key.clone(), None, || async move {
                runs.fetch_add(1, Ordering::SeqCst);
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
    assert_eq!(handler_runs.load(Ordering::SeqCst), 3);
}
