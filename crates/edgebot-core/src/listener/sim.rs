//! Synthetic event generator for smoke-testing the pipeline end to end.
//!
//! Emits plausible log-shaped envelopes at a fixed rate without any real
//! input. A pull-style source: when the spool is full it backs off by
//! doubling its delay (capped) instead of dropping.

use super::{EnqueueHandle, Listener};
use crate::envelope::{Envelope, EventType};
use crate::error::SpoolError;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SOURCE: &str = "sim";
const MAX_BACKOFF_MULTIPLIER: u32 = 16;

const SERVICES: &[&str] = &["nginx", "sshd", "postgres", "redis", "cron"];
const SEVERITIES: &[&str] = &["debug", "info", "warning", "error"];
const MESSAGES: &[&str] = &[
    "connection established",
    "request completed",
    "authentication succeeded",
    "cache miss",
    "retrying upstream",
    "configuration reloaded",
    "worker heartbeat",
];

pub struct SimListener {
    interval: Duration,
    running: AtomicBool,
}

impl SimListener {
    pub fn new(interval: Duration) -> Self {
        SimListener {
            interval,
            running: AtomicBool::new(false),
        }
    }

    fn generate(&self) -> Envelope {
        let mut rng = rand::thread_rng();
        let service = SERVICES.choose(&mut rng).unwrap_or(&"app");
        let severity = SEVERITIES.choose(&mut rng).unwrap_or(&"info");
        let message = MESSAGES.choose(&mut rng).unwrap_or(&"tick");
        Envelope::new(EventType::Other, SOURCE)
            .with_label("service", *service)
            .with_label("severity", *severity)
            .with_payload_field("message", json!(message))
            .with_payload_field("seq", json!(rng.gen_range(0..1_000_000)))
    }
}

#[async_trait]
impl Listener for SimListener {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError> {
        info!(interval_ms = self.interval.as_millis() as u64, "sim listener started");
        self.running.store(true, Ordering::Release);
        let mut backoff_multiplier: u32 = 1;

        loop {
            let delay = self.interval * backoff_multiplier;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("sim listener stopping");
                    self.running.store(false, Ordering::Release);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {
                    match enqueue.enqueue(self.generate()).await {
                        Ok(_) => backoff_multiplier = 1,
                        Err(SpoolError::CapacityExceeded) => {
                            // Pull source: double the next delay instead of dropping.
                            backoff_multiplier =
                                (backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
                            debug!(backoff_multiplier, "spool full, sim backing off");
                        }
                        Err(SpoolError::Unavailable(reason)) => {
                            backoff_multiplier =
                                (backoff_multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
                            debug!(%reason, "spool unavailable, sim backing off");
                        }
                    }
                }
            }
        }
    }

    fn healthy(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
