//! Durability of the disk spool through the full shipping path.

use edgebot_core::breaker::SinkBreaker;
use edgebot_core::config::Config;
use edgebot_core::envelope::{Envelope, EventType, DEFAULT_CLOCK_SKEW_BOUND};
use edgebot_core::limiter::TokenBucket;
use edgebot_core::listener::EnqueueHandle;
use edgebot_core::metrics::Metrics;
use edgebot_core::retry::RetryPolicy;
use edgebot_core::shipper::{Shipper, ShipperConfig, SinkRuntime, Tunables};
use edgebot_core::sink::FileSink;
use edgebot_core::spool::{DiskSpool, DiskSpoolConfig, Spool};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn open_spool(dir: &Path) -> Arc<dyn Spool> {
    Arc::new(DiskSpool::open(dir, DiskSpoolConfig::default()).unwrap())
}

fn shipper_over(spool: Arc<dyn Spool>, out_dir: &Path) -> Shipper {
    let config = Config::default();
    Shipper::new(
        spool,
        Arc::new(Notify::new()),
        TokenBucket::new(10_000, 10_000.0),
        vec![SinkRuntime {
            sink: Arc::new(FileSink::new(out_dir, true)),
            breaker: SinkBreaker::new(config.breaker_config()),
            retry: RetryPolicy {
                max_retries: 1,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                jitter_factor: 0.0,
                attempt_timeout: Duration::from_secs(5),
            },
        }],
        Metrics::new(),
        Tunables::new(100, 1 << 20, Duration::from_millis(50)),
        ShipperConfig {
            node_id: "edge-durability".to_string(),
            lease: Duration::from_secs(60),
            ..ShipperConfig::default()
        },
    )
}

async fn seed_events(spool: &Arc<dyn Spool>, metrics: Arc<Metrics>, count: usize) {
    let enqueue = EnqueueHandle::new(
        Arc::clone(spool),
        Arc::new(Notify::new()),
        metrics,
        DEFAULT_CLOCK_SKEW_BOUND,
    );
    for n in 0..count {
        enqueue
            .enqueue(
                Envelope::new(EventType::LogFile, "file:/var/log/app.log")
                    .with_payload_field("line", json!(format!("line-{n}"))),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn events_survive_restart_and_ship_in_order() {
    let state = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    {
        let spool = open_spool(state.path());
        seed_events(&spool, Metrics::new(), 7).await;
        // Process "crashes" here: spool dropped without any shipping.
    }

    let spool = open_spool(state.path());
    assert_eq!(spool.stats().await.unwrap().pending, 7);

    let shipper = shipper_over(Arc::clone(&spool), out.path());
    shipper.ship_cycle(&CancellationToken::new()).await;

    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.pending + stats.in_flight, 0);

    // One batch pair on disk, events in enqueue order.
    let json_path = std::fs::read_dir(out.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .expect("payload written");
    let body: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
    assert_eq!(body["batch_size"], json!(7));
    let lines: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["payload"]["line"].as_str().unwrap())
        .collect();
    let expected: Vec<String> = (0..7).map(|n| format!("line-{n}")).collect();
    assert_eq!(lines, expected.iter().map(String::as_str).collect::<Vec<_>>());
}

#[tokio::test]
async fn missing_output_directory_dead_letters_batch() {
    let state = TempDir::new().unwrap();
    let spool = open_spool(state.path());
    seed_events(&spool, Metrics::new(), 2).await;

    let shipper = shipper_over(Arc::clone(&spool), Path::new("/nonexistent/edgebot-out"));
    shipper.ship_cycle(&CancellationToken::new()).await;

    let stats = spool.stats().await.unwrap();
    assert_eq!(stats.dead, 2);
    assert_eq!(stats.pending, 0);

    // Dead-letter export exists for the operator.
    let dead_files: Vec<_> = std::fs::read_dir(state.path().join("dead"))
        .unwrap()
        .collect();
    assert_eq!(dead_files.len(), 2);
}
