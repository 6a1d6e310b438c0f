//! Weather context poller against an Open-Meteo-style forecast API.
//!
//! Fetches current conditions for a fixed coordinate pair on a long
//! interval and wraps the provider's JSON opaquely in a `weather` envelope.
//! A pull source twice over: it backs off on HTTP failures and on spool
//! capacity rather than dropping.

use super::{EnqueueHandle, Listener};
use crate::envelope::{Envelope, EventType};
use crate::error::SpoolError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOURCE: &str = "weather";

/// Consecutive failed polls before the listener reports unhealthy.
const MAX_FAILURES: u32 = 10;

/// Longest delay between retries after a failed poll.
const FAILURE_BACKOFF: Duration = Duration::from_secs(300);

/// Current-conditions fields requested from the provider.
const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,apparent_temperature,is_day,\
precipitation,rain,showers,snowfall,weather_code,cloud_cover,pressure_msl,surface_pressure,\
wind_speed_10m,wind_direction_10m,wind_gusts_10m";

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub interval: Duration,
    pub timeout: Duration,
}

pub struct WeatherPoller {
    config: WeatherConfig,
    running: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl WeatherPoller {
    pub fn new(config: WeatherConfig) -> Self {
        WeatherPoller {
            config,
            running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    async fn poll_once(&self, client: &reqwest::Client) -> Result<Envelope, String> {
        let response = client
            .get(&self.config.url)
            .query(&[
                ("latitude", self.config.latitude.to_string()),
                ("longitude", self.config.longitude.to_string()),
                ("current", CURRENT_FIELDS.to_string()),
                ("timezone", "UTC".to_string()),
                ("forecast_days", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| format!("weather request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("weather api returned {}", response.status()));
        }
        let data: Value = response
            .json()
            .await
            .map_err(|e| format!("weather response not json: {e}"))?;

        Ok(conditions_envelope(
            self.config.latitude,
            self.config.longitude,
            &data,
        ))
    }
}

fn conditions_envelope(latitude: f64, longitude: f64, data: &Value) -> Envelope {
    Envelope::new(EventType::Weather, SOURCE)
        .with_payload_field("provider", json!("open-meteo"))
        .with_payload_field(
            "location",
            json!({
                "latitude": latitude,
                "longitude": longitude,
                "timezone": data.get("timezone").cloned().unwrap_or(Value::Null),
                "elevation": data.get("elevation").cloned().unwrap_or(Value::Null),
            }),
        )
        .with_payload_field(
            "current",
            data.get("current").cloned().unwrap_or(Value::Null),
        )
        .with_payload_field(
            "units",
            data.get("current_units").cloned().unwrap_or(Value::Null),
        )
}

#[async_trait]
impl Listener for WeatherPoller {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(format!("edgebot/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SpoolError::Unavailable(format!("build weather client: {e}")))?;

        self.running.store(true, Ordering::Release);
        info!(
            latitude = self.config.latitude,
            longitude = self.config.longitude,
            interval_sec = self.config.interval.as_secs(),
            "weather poller started"
        );

        // First poll lands right away; subsequent ones follow the interval.
        let mut delay = Duration::from_millis(10);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("weather poller stopping");
                    self.running.store(false, Ordering::Release);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {
                    match self.poll_once(&client).await {
                        Ok(envelope) => {
                            self.consecutive_failures.store(0, Ordering::Relaxed);
                            delay = match enqueue.enqueue(envelope).await {
                                Ok(_) => self.config.interval,
                                // Pull source: retry the same observation window
                                // sooner instead of dropping.
                                Err(SpoolError::CapacityExceeded) => {
                                    debug!("spool full, deferring weather poll");
                                    FAILURE_BACKOFF.min(self.config.interval)
                                }
                                Err(SpoolError::Unavailable(reason)) => {
                                    warn!(%reason, "spool unavailable, deferring weather poll");
                                    FAILURE_BACKOFF.min(self.config.interval)
                                }
                            };
                        }
                        Err(reason) => {
                            let failures =
                                self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            warn!(%reason, failures, "weather poll failed");
                            delay = FAILURE_BACKOFF.min(self.config.interval);
                        }
                    }
                }
            }
        }
    }

    fn healthy(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.consecutive_failures.load(Ordering::Relaxed) < MAX_FAILURES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DEFAULT_CLOCK_SKEW_BOUND;
    use crate::metrics::Metrics;
    use crate::spool::{MemorySpool, Spool};
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use tokio::sync::Notify;

    async fn mock_provider(body: Value, status: u16) -> String {
        let app = Router::new().route(
            "/v1/forecast",
            get(move || {
                let body = body.clone();
                async move {
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        axum::Json(body),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/forecast")
    }

    fn poller(url: String) -> WeatherPoller {
        WeatherPoller::new(WeatherConfig {
            url,
            latitude: 59.33,
            longitude: 18.06,
            interval: Duration::from_secs(3600),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn conditions_envelope_wraps_provider_json() {
        let data = json!({
            "timezone": "UTC",
            "elevation": 28.0,
            "current": {"temperature_2m": 4.2, "wind_speed_10m": 11.0},
            "current_units": {"temperature_2m": "°C"},
        });
        let envelope = conditions_envelope(59.33, 18.06, &data);
        assert_eq!(envelope.kind, EventType::Weather);
        assert_eq!(envelope.payload["location"]["latitude"], json!(59.33));
        assert_eq!(envelope.payload["current"]["temperature_2m"], json!(4.2));
        assert_eq!(envelope.payload["units"]["temperature_2m"], json!("°C"));
    }

    #[tokio::test]
    async fn poll_once_builds_weather_envelope() {
        let url = mock_provider(
            json!({
                "timezone": "UTC",
                "elevation": 10.0,
                "current": {"temperature_2m": -2.5},
                "current_units": {},
            }),
            200,
        )
        .await;
        let poller = poller(url);
        let client = reqwest::Client::new();

        let envelope = poller.poll_once(&client).await.expect("poll succeeds");
        assert_eq!(envelope.source, "weather");
        assert_eq!(envelope.payload["current"]["temperature_2m"], json!(-2.5));
    }

    #[tokio::test]
    async fn failed_poll_reports_error() {
        let url = mock_provider(json!({}), 503).await;
        let poller = poller(url);
        let client = reqwest::Client::new();

        let err = poller.poll_once(&client).await.expect_err("503 fails");
        assert!(err.contains("503"));
    }

    #[tokio::test]
    async fn run_enqueues_first_observation() {
        let url = mock_provider(
            json!({
                "timezone": "UTC",
                "current": {"temperature_2m": 7.0},
                "current_units": {},
            }),
            200,
        )
        .await;
        let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(100));
        let enqueue = EnqueueHandle::new(
            Arc::clone(&spool),
            Arc::new(Notify::new()),
            Metrics::new(),
            DEFAULT_CLOCK_SKEW_BOUND,
        );
        let poller = Arc::new(poller(url));

        let cancel = CancellationToken::new();
        let task = {
            let poller = Arc::clone(&poller);
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel, enqueue).await })
        };

        let mut claimed = Vec::new();
        for _ in 0..200 {
            claimed = spool
                .claim_batch(10, usize::MAX, Duration::from_secs(60))
                .await
                .unwrap();
            if !claimed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].1.kind, EventType::Weather);
        assert!(poller.healthy());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
