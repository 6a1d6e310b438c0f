//! Liveness probe and metrics exposition over local HTTP.
//!
//! `GET /healthz` reports the aggregate status plus a per-task table;
//! `GET /metrics` exports the Prometheus registry, refreshing the spool
//! gauges at scrape time so they are accurate even between ship cycles.

use crate::metrics::Metrics;
use crate::spool::Spool;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Aggregate service status as reported by `/healthz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Degraded,
    ShuttingDown,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TaskHealth {
    healthy: bool,
    degraded: bool,
    last_error: Option<String>,
    started_at: Option<Instant>,
    restarts: u32,
}

/// Shared task table written by the supervisor, read by the endpoint.
/// Readers take brief snapshots; eventual consistency is fine here.
pub struct HealthState {
    status: RwLock<ServiceStatus>,
    tasks: RwLock<BTreeMap<String, TaskHealth>>,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(HealthState {
            status: RwLock::new(ServiceStatus::Starting),
            tasks: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: ServiceStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn task_started(&self, name: &str) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.entry(name.to_string()).or_default();
        entry.healthy = true;
        entry.degraded = false;
        entry.started_at = Some(Instant::now());
    }

    pub fn task_failed(&self, name: &str, error: &str) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.entry(name.to_string()).or_default();
        entry.healthy = false;
        entry.last_error = Some(error.to_string());
        entry.started_at = None;
    }

    pub fn task_stopped(&self, name: &str) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.entry(name.to_string()).or_default();
        entry.healthy = false;
        entry.started_at = None;
    }

    pub fn task_degraded(&self, name: &str) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.entry(name.to_string()).or_default();
        entry.healthy = false;
        entry.degraded = true;
    }

    pub fn task_restarted(&self, name: &str) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.entry(name.to_string()).or_default().restarts += 1;
    }

    pub fn set_task_healthy(&self, name: &str, healthy: bool) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let entry = tasks.entry(name.to_string()).or_default();
        if !entry.degraded {
            entry.healthy = healthy;
        }
    }

    pub fn any_degraded(&self) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|t| t.degraded)
    }

    fn services_json(&self) -> serde_json::Value {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut services = serde_json::Map::new();
        for (name, task) in tasks.iter() {
            let mut entry = serde_json::Map::new();
            entry.insert("healthy".into(), json!(task.healthy));
            if let Some(error) = &task.last_error {
                entry.insert("last_error".into(), json!(error));
            }
            if let Some(started) = task.started_at {
                entry.insert("uptime_sec".into(), json!(started.elapsed().as_secs()));
            }
            if task.restarts > 0 {
                entry.insert("restarts".into(), json!(task.restarts));
            }
            services.insert(name.clone(), serde_json::Value::Object(entry));
        }
        serde_json::Value::Object(services)
    }
}

#[derive(Clone)]
struct AppState {
    health: Arc<HealthState>,
    metrics: Arc<Metrics>,
    spool: Arc<dyn Spool>,
}

/// The local-bound health/metrics HTTP server.
pub struct HealthServer {
    bind: SocketAddr,
    state: AppState,
}

impl HealthServer {
    pub fn new(
        bind: SocketAddr,
        health: Arc<HealthState>,
        metrics: Arc<Metrics>,
        spool: Arc<dyn Spool>,
    ) -> Self {
        HealthServer {
            bind,
            state: AppState {
                health,
                metrics,
                spool,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics_text))
            .with_state(self.state.clone())
    }

    /// Serves until cancelled. Bind failures surface to the supervisor,
    /// which restarts with backoff.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(self.bind).await?;
        info!(bind = %self.bind, "health endpoint listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
    }
}

async fn healthz(State(app): State<AppState>) -> Response {
    let status = app.health.status();
    let body = json!({
        "status": status.as_str(),
        "timestamp": Utc::now(),
        "services": app.health.services_json(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    let code = if status == ServiceStatus::Degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, axum::Json(body)).into_response()
}

async fn metrics_text(State(app): State<AppState>) -> Response {
    // Refresh spool gauges at scrape time.
    if let Ok(stats) = app.spool.stats().await {
        app.metrics.spool_pending.set(stats.claimable() as i64);
        app.metrics.spool_inflight.set(stats.in_flight as i64);
        app.metrics.spool_bytes.set(stats.total_bytes as i64);
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        app.metrics.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EventType};
    use crate::spool::MemorySpool;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn request(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn server(health: Arc<HealthState>) -> (HealthServer, Arc<dyn Spool>) {
        let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(100));
        let server = HealthServer::new(
            "127.0.0.1:0".parse().unwrap(),
            health,
            Metrics::new(),
            Arc::clone(&spool),
        );
        (server, spool)
    }

    #[tokio::test]
    async fn healthz_reports_services() {
        let health = HealthState::new();
        health.set_status(ServiceStatus::Healthy);
        health.task_started("shipper");
        health.task_failed("syslog_udp", "bind: address in use");
        let (server, _spool) = server(Arc::clone(&health));

        let (status, body) = request(server.router(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["status"], "healthy");
        assert_eq!(parsed["services"]["shipper"]["healthy"], true);
        assert_eq!(parsed["services"]["syslog_udp"]["healthy"], false);
        assert!(parsed["services"]["syslog_udp"]["last_error"]
            .as_str()
            .unwrap()
            .contains("bind"));
    }

    #[tokio::test]
    async fn degraded_returns_503() {
        let health = HealthState::new();
        health.task_degraded("syslog_udp");
        health.set_status(ServiceStatus::Degraded);
        let (server, _spool) = server(health);

        let (status, body) = request(server.router(), "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("degraded"));
    }

    #[tokio::test]
    async fn metrics_refreshes_spool_gauges() {
        let health = HealthState::new();
        let (server, spool) = server(health);
        spool
            .enqueue(Envelope::new(EventType::Other, "sim"))
            .await
            .unwrap();

        let (status, body) = request(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("edgebot_spool_pending 1"));
        assert!(body.contains("edgebot_up 1"));
    }

    #[tokio::test]
    async fn degraded_flag_sticks_over_healthy_poll() {
        let health = HealthState::new();
        health.task_degraded("flows");
        health.set_task_healthy("flows", true);
        assert!(health.any_degraded());
    }
}
