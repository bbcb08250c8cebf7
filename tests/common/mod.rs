//! Shared infrastructure for the integration suites.
//!
//! Everything runs against the in-process memory store, so the suites are
//! hermetic: no Redis required.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mlg_backbone::{
    Backbone, BackboneConfig, InvalidationConfig, MemoryStore, MonitorConfig, StoreConfig,
};

/// Install a test-writer subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Backbone over a fresh memory store, with invalidation tightened for
/// fast tests and sampling disabled so every query records.
pub fn test_backbone() -> (Arc<MemoryStore>, Backbone) {
    init_tracing();
    let remote = Arc::new(MemoryStore::new());
    let cfg = BackboneConfig {
        store: StoreConfig {
            // Short breaker cool-down so outage tests can recover quickly.
            breaker_cooldown: Duration::from_millis(200),
            ..StoreConfig::default()
        },
        invalidation: InvalidationConfig {
            invalidation_delay: Duration::from_millis(50),
            batch_window: Duration::from_millis(200),
            retry_delay: Duration::from_millis(10),
            ..InvalidationConfig::default()
        },
        monitor: MonitorConfig {
            sampling_rate: 1.0,
            ..MonitorConfig::default()
        },
        ..BackboneConfig::default()
    };
    let backbone = Backbone::with_store(cfg, remote.clone());
    (remote, backbone)
}

/// A JSON body of roughly `kib` KiB, compressible like real payloads.
pub fn json_body(kib: usize) -> Vec<u8> {
    let row = r#"{"rank":1,"user":"shadow-fox","score":987654,"clan":"MLG"},"#;
    let mut body = Vec::with_capacity(kib * 1024 + row.len() + 2);
    body.push(b'[');
    while body.len() < kib * 1024 {
        body.extend_from_slice(row.as_bytes());
    }
    body.pop();
    body.push(b']');
    body
}

/// Inflate a gzip body (what a client does on `Content-Encoding: gzip`).
pub fn gunzip(body: &[u8]) -> Vec<u8> {
    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).expect("valid gzip body");
    out
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
