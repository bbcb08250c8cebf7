//! Query-monitor integration through the backbone facade: slow-query
//! alerting, regression detection, percentiles, hints.

mod common;

use common::*;

use std::time::Duration;

use mlg_backbone::monitor::{HintKind, MonitorEvent, QueryClass};
use mlg_backbone::QueryContext;

#[tokio::test]
async fn ten_slow_voting_queries_emit_exactly_one_alert() {
    let (_, backbone) = test_backbone();
    let mut events = backbone.monitor().subscribe();

    // Ten voting queries at 250 ms against a 100 ms SLA.
    for i in 0..10 {
        backbone.record_query(
            &format!("SELECT * FROM voting_rounds WHERE content_id = {i}"),
            &[],
            Duration::from_millis(250),
            QueryContext {
                route: Some("/api/voting/results".into()),
                principal: None,
            },
        );
    }
    backbone.monitor().flush().await;

    let mut alerts = 0;
    let mut slow_events = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            MonitorEvent::Alert {
                kind, slow_count, ..
            } => {
                assert_eq!(kind, "slow_queries_threshold");
                assert_eq!(slow_count, 10);
                alerts += 1;
            }
            MonitorEvent::SlowQuery { class, .. } => {
                assert_eq!(class, QueryClass::Voting);
                slow_events += 1;
            }
            MonitorEvent::Regression { .. } => {}
        }
    }
    assert_eq!(alerts, 1, "one alert, then the window counter resets");
    assert_eq!(slow_events, 10);
    assert_eq!(backbone.monitor().stats().alerts, 1);
}

#[tokio::test]
async fn doubling_latency_triggers_one_regression() {
    let (_, backbone) = test_backbone();
    let monitor = backbone.monitor().clone();
    let mut events = monitor.subscribe();
    let sql = "SELECT * FROM sessions WHERE token = 'abc123'";

    for _ in 0..20 {
        backbone.record_query(sql, &[], Duration::from_millis(40), QueryContext::default());
    }
    for _ in 0..20 {
        backbone.record_query(sql, &[], Duration::from_millis(80), QueryContext::default());
    }
    monitor.flush().await;

    let mut regressions = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MonitorEvent::Regression {
            baseline_avg,
            current_avg,
            regression_percent,
            ..
        } = event
        {
            regressions.push((baseline_avg, current_avg, regression_percent));
        }
    }
    assert_eq!(regressions.len(), 1);
    let (baseline, current, percent) = regressions[0];
    assert!((baseline - 40.0).abs() < 1.0, "baseline ≈ 40, got {baseline}");
    assert!((current - 80.0).abs() < 1.0, "current ≈ 80, got {current}");
    assert!((percent - 100.0).abs() < 5.0, "≈ 100% regression, got {percent}");
}

#[tokio::test]
async fn percentiles_respect_the_rank_definition() {
    let (_, backbone) = test_backbone();

    for millis in 1..=200u64 {
        backbone.record_query(
            "SELECT * FROM sessions WHERE id = 1",
            &[],
            Duration::from_millis(millis),
            QueryContext::default(),
        );
    }
    backbone.monitor().flush().await;

    let p = backbone.monitor().percentiles();
    assert_eq!(p.samples, 200);
    // value at ceil(p/100 * n) - 1 after ascending sort
    assert_eq!(p.p95, 190);
    assert_eq!(p.p99, 198);
}

#[tokio::test]
async fn unbounded_scans_surface_as_suggestions() {
    let (_, backbone) = test_backbone();

    backbone.record_query(
        "SELECT * FROM content_items",
        &[],
        Duration::from_millis(30),
        QueryContext::default(),
    );
    backbone.monitor().flush().await;

    let suggestions = backbone.monitor().suggestions();
    assert!(suggestions
        .iter()
        .any(|(_, hint)| hint.kind == HintKind::UnboundedScan));
}

#[tokio::test]
async fn literal_values_share_one_query_hash() {
    let (_, backbone) = test_backbone();

    for id in [1, 99, 12345] {
        backbone.record_query(
            &format!("SELECT * FROM clans WHERE id = {id}"),
            &[],
            Duration::from_millis(20),
            QueryContext::default(),
        );
    }
    backbone.monitor().flush().await;

    let stats = backbone.monitor().stats();
    assert_eq!(stats.recorded, 3);
    assert_eq!(stats.tracked_hashes, 1, "literals normalize to one hash");
}
