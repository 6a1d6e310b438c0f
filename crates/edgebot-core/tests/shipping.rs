//! End-to-end shipping tests against an in-process mock mothership.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use edgebot_core::breaker::SinkBreaker;
use edgebot_core::config::Config;
use edgebot_core::envelope::{Envelope, EventType, DEFAULT_CLOCK_SKEW_BOUND};
use edgebot_core::limiter::TokenBucket;
use edgebot_core::listener::EnqueueHandle;
use edgebot_core::metrics::Metrics;
use edgebot_core::retry::RetryPolicy;
use edgebot_core::shipper::{Shipper, ShipperConfig, SinkRuntime, Tunables};
use edgebot_core::sink::{HttpSink, HttpSinkConfig, TlsSettings};
use edgebot_core::spool::{MemorySpool, Spool};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Recorded {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[derive(Default)]
struct Mothership {
    requests: Vec<Recorded>,
    /// Status codes to return before switching to 200.
    scripted_failures: VecDeque<u16>,
}

type Shared = Arc<Mutex<Mothership>>;

async fn ingest(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let mut server = state.lock().unwrap();
    server.requests.push(Recorded {
        headers: headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: body.to_vec(),
    });
    match server.scripted_failures.pop_front() {
        Some(code) => StatusCode::from_u16(code).unwrap(),
        None => StatusCode::OK,
    }
}

async fn start_mothership(scripted_failures: Vec<u16>) -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(Mothership {
        requests: Vec::new(),
        scripted_failures: scripted_failures.into(),
    }));
    let app = Router::new()
        .route("/ingest", post(ingest))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/ingest"), state)
}

struct Edge {
    shipper: Shipper,
    spool: Arc<dyn Spool>,
    enqueue: EnqueueHandle,
    metrics: Arc<Metrics>,
}

fn edge(url: &str, auth_token: Option<&str>, max_retries: u32) -> Edge {
    let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(10_000));
    let signal = Arc::new(Notify::new());
    let metrics = Metrics::new();
    let enqueue = EnqueueHandle::new(
        Arc::clone(&spool),
        Arc::clone(&signal),
        Arc::clone(&metrics),
        DEFAULT_CLOCK_SKEW_BOUND,
    );

    let sink = HttpSink::new(HttpSinkConfig {
        url: url.to_string(),
        auth_token: auth_token.map(str::to_string),
        compression: true,
        timeout: Duration::from_secs(5),
        tls: TlsSettings::default(),
    })
    .unwrap();

    let config = Config::default();
    let shipper = Shipper::new(
        Arc::clone(&spool),
        signal,
        TokenBucket::new(10_000, 10_000.0),
        vec![SinkRuntime {
            sink: Arc::new(sink),
            breaker: SinkBreaker::new(config.breaker_config()),
            retry: RetryPolicy {
                max_retries,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                jitter_factor: 0.0,
                attempt_timeout: Duration::from_secs(5),
            },
        }],
        Arc::clone(&metrics),
        Tunables::new(100, 1 << 20, Duration::from_millis(100)),
        ShipperConfig {
            node_id: "edge-test".to_string(),
            lease: Duration::from_secs(60),
            ..ShipperConfig::default()
        },
    );

    Edge {
        shipper,
        spool,
        enqueue,
        metrics,
    }
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
    out
}

fn decoded_body(recorded: &Recorded) -> serde_json::Value {
    serde_json::from_slice(&gunzip(&recorded.body)).unwrap()
}

fn header<'a>(recorded: &'a Recorded, name: &str) -> Option<&'a str> {
    recorded
        .headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

async fn enqueue_syslog(enqueue: &EnqueueHandle, messages: &[&str]) {
    for m in messages {
        enqueue
            .enqueue(
                Envelope::new(EventType::Syslog, "syslog_udp")
                    .with_label("host", "edge-01")
                    .with_payload_field("message", json!(m)),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn happy_path_posts_one_ordered_gzip_batch() {
    let (url, server) = start_mothership(vec![]).await;
    let edge = edge(&url, Some("token-123"), 5);
    enqueue_syslog(&edge.enqueue, &["a", "b", "c"]).await;

    edge.shipper.ship_cycle(&CancellationToken::new()).await;

    let server = server.lock().unwrap();
    assert_eq!(server.requests.len(), 1);
    let request = &server.requests[0];

    assert_eq!(header(request, "content-type"), Some("application/json"));
    assert_eq!(header(request, "content-encoding"), Some("gzip"));
    assert_eq!(header(request, "x-edgebot-batch-size"), Some("3"));
    assert_eq!(header(request, "authorization"), Some("Bearer token-123"));
    assert!(header(request, "user-agent").unwrap().starts_with("edgebot/"));
    assert_eq!(header(request, "x-retry"), None);

    let body = decoded_body(request);
    assert_eq!(body["batch_size"], json!(3));
    assert_eq!(body["source"], json!("edge-test"));
    assert_eq!(body["is_retry"], json!(false));
    let messages: Vec<&str> = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["payload"]["message"].as_str().unwrap())
        .collect();
    assert_eq!(messages, vec!["a", "b", "c"]);

    drop(server);
    let stats = edge.spool.stats().await.unwrap();
    assert_eq!(stats.pending + stats.in_flight, 0);
    assert_eq!(
        edge.metrics.events_sent.with_label_values(&["http"]).get(),
        3
    );
    assert_eq!(
        edge.metrics.batches_sent.with_label_values(&["http"]).get(),
        1
    );
}

#[tokio::test]
async fn retries_on_503_until_accepted() {
    let (url, server) = start_mothership(vec![503, 503, 503]).await;
    let edge = edge(&url, None, 5);
    enqueue_syslog(&edge.enqueue, &["only"]).await;

    edge.shipper.ship_cycle(&CancellationToken::new()).await;

    assert_eq!(server.lock().unwrap().requests.len(), 4);
    assert_eq!(edge.metrics.retries.with_label_values(&["http"]).get(), 3);
    let stats = edge.spool.stats().await.unwrap();
    assert_eq!(stats.pending + stats.in_flight + stats.dead, 0);
}

#[tokio::test]
async fn permanent_400_dead_letters_without_retry() {
    let (url, server) = start_mothership(vec![400, 400, 400, 400]).await;
    let edge = edge(&url, None, 5);
    enqueue_syslog(&edge.enqueue, &["poison"]).await;

    edge.shipper.ship_cycle(&CancellationToken::new()).await;

    assert_eq!(server.lock().unwrap().requests.len(), 1, "no retry on 4xx");
    assert_eq!(
        edge.metrics
            .batches_failed
            .with_label_values(&["http", "permanent"])
            .get(),
        1
    );
    assert_eq!(edge.spool.stats().await.unwrap().dead, 1);
}

#[tokio::test]
async fn outbound_payload_is_sanitized() {
    let (url, server) = start_mothership(vec![]).await;
    let edge = edge(&url, None, 5);

    edge.enqueue
        .enqueue(
            Envelope::new(EventType::Flow, "flows_udp")
                .with_payload_field("__collector_state", json!("internal"))
                .with_payload_field("packets", json!(42))
                .with_payload_field("nested", json!({"__hidden": true, "kept": 1})),
        )
        .await
        .unwrap();

    edge.shipper.ship_cycle(&CancellationToken::new()).await;

    let server = server.lock().unwrap();
    let body = decoded_body(&server.requests[0]);
    let raw = serde_json::to_string(&body).unwrap();
    assert!(!raw.contains("spool_id"));
    assert!(!raw.contains("\"attempts\""));
    assert!(!raw.contains("__"));
    assert_eq!(body["messages"][0]["payload"]["packets"], json!(42));
    assert_eq!(body["messages"][0]["payload"]["nested"]["kept"], json!(1));
}

#[tokio::test]
async fn http_429_is_retried_as_transient() {
    let (url, server) = start_mothership(vec![429]).await;
    let edge = edge(&url, None, 3);
    enqueue_syslog(&edge.enqueue, &["rate-limited"]).await;

    let started = std::time::Instant::now();
    edge.shipper.ship_cycle(&CancellationToken::new()).await;

    // 429 without Retry-After falls back to the configured 10ms backoff.
    assert_eq!(server.lock().unwrap().requests.len(), 2);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        edge.metrics.events_sent.with_label_values(&["http"]).get(),
        1
    );
}

#[tokio::test]
async fn shutdown_drain_flushes_pending_batch() {
    let (url, server) = start_mothership(vec![]).await;
    let edge = edge(&url, None, 5);
    enqueue_syslog(&edge.enqueue, &["late", "arrivals"]).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    // A cancelled run goes straight to the drain pass.
    edge.shipper.run(cancel).await;

    assert_eq!(server.lock().unwrap().requests.len(), 1);
    let stats = edge.spool.stats().await.unwrap();
    assert_eq!(stats.pending + stats.in_flight, 0);
}
