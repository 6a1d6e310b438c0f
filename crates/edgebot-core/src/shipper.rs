//! The batched shipper: spool to sinks, with rate limiting, retries and
//! circuit breaking.
//!
//! A single long-lived task. Each cycle it lets every enabled sink claim its
//! own batch (independent cursors), gates the send on the token bucket, runs
//! the retry policy around the write, and commits or dead-letters the batch
//! on the terminal outcome. The wakeup contract is "batch ready or timeout
//! or shutdown": enqueues signal a `Notify`, a deadline timer covers the
//! trickle case, and cancellation triggers a final drain.

use crate::breaker::SinkBreaker;
use crate::envelope::{BatchEnvelope, Envelope};
use crate::limiter::{RateMode, TokenBucket};
use crate::metrics::Metrics;
use crate::retry::{RetryError, RetryPolicy};
use crate::sink::Sink;
use crate::spool::Spool;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive spool failures before the shipper reports unhealthy.
const SPOOL_ERROR_HEALTH_THRESHOLD: u32 = 3;

/// Batch knobs that SIGHUP may reload while the shipper runs.
pub struct Tunables {
    max_batch_size: AtomicUsize,
    max_batch_bytes: AtomicUsize,
    batch_timeout_ms: AtomicU64,
}

impl Tunables {
    pub fn new(max_batch_size: usize, max_batch_bytes: usize, batch_timeout: Duration) -> Arc<Self> {
        Arc::new(Tunables {
            max_batch_size: AtomicUsize::new(max_batch_size),
            max_batch_bytes: AtomicUsize::new(max_batch_bytes),
            batch_timeout_ms: AtomicU64::new(batch_timeout.as_millis() as u64),
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.load(Ordering::Relaxed).max(1)
    }

    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_bytes.load(Ordering::Relaxed).max(1)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms.load(Ordering::Relaxed).max(10))
    }

    pub fn update(&self, max_batch_size: usize, max_batch_bytes: usize, batch_timeout: Duration) {
        self.max_batch_size.store(max_batch_size, Ordering::Relaxed);
        self.max_batch_bytes.store(max_batch_bytes, Ordering::Relaxed);
        self.batch_timeout_ms
            .store(batch_timeout.as_millis() as u64, Ordering::Relaxed);
        info!(max_batch_size, max_batch_bytes, "shipper tunables reloaded");
    }
}

/// One enabled sink with its independent breaker and retry policy.
pub struct SinkRuntime {
    pub sink: Arc<dyn Sink>,
    pub breaker: SinkBreaker,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct ShipperStats {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub bytes_sent: u64,
    pub batches_failed: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// The edge node's identity string, placed in every outbound envelope.
    pub node_id: String,
    /// Claim lease; default is five times the per-attempt timeout.
    pub lease: Duration,
    pub housekeeping_interval: Duration,
    /// Age at which dead-lettered records are pruned.
    pub dead_retention: Duration,
    pub rate_mode: RateMode,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        ShipperConfig {
            node_id: "edgebot".to_string(),
            lease: Duration::from_secs(150),
            housekeeping_interval: Duration::from_secs(60),
            dead_retention: Duration::from_secs(7 * 24 * 60 * 60),
            rate_mode: RateMode::Events,
        }
    }
}

pub struct Shipper {
    spool: Arc<dyn Spool>,
    signal: Arc<Notify>,
    limiter: TokenBucket,
    sinks: Vec<SinkRuntime>,
    metrics: Arc<Metrics>,
    tunables: Arc<Tunables>,
    config: ShipperConfig,
    stats: Mutex<ShipperStats>,
    spool_errors: AtomicU32,
}

impl Shipper {
    pub fn new(
        spool: Arc<dyn Spool>,
        signal: Arc<Notify>,
        limiter: TokenBucket,
        sinks: Vec<SinkRuntime>,
        metrics: Arc<Metrics>,
        tunables: Arc<Tunables>,
        config: ShipperConfig,
    ) -> Self {
        Shipper {
            spool,
            signal,
            limiter,
            sinks,
            metrics,
            tunables,
            config,
            stats: Mutex::new(ShipperStats::default()),
            spool_errors: AtomicU32::new(0),
        }
    }

    /// The shipper main loop; returns after the shutdown drain.
    pub async fn run(&self, cancel: CancellationToken) {
        // Recover leases orphaned by a previous incarnation before shipping.
        if let Err(e) = self.spool.reap_stale().await {
            warn!(error = %e, "startup reap failed");
        }
        self.update_spool_gauges().await;

        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.tick().await;

        let mut deadline = Instant::now() + self.tunables.batch_timeout();
        info!(sinks = self.sinks.len(), "shipper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain().await;
                    info!("shipper stopped");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.ship_cycle(&cancel).await;
                    deadline = Instant::now() + self.tunables.batch_timeout();
                }
                _ = self.signal.notified() => {
                    if self.claimable_count().await >= self.tunables.max_batch_size() as u64 {
                        self.ship_cycle(&cancel).await;
                        deadline = Instant::now() + self.tunables.batch_timeout();
                    }
                }
                _ = housekeeping.tick() => {
                    self.housekeep().await;
                }
            }
        }
    }

    /// One pass over every sink. Public so tests and the drain path can
    /// drive cycles without the timer.
    pub async fn ship_cycle(&self, cancel: &CancellationToken) {
        for runtime in &self.sinks {
            self.ship_one(cancel, runtime, &runtime.retry).await;
        }
        self.update_spool_gauges().await;
    }

    async fn ship_one(&self, cancel: &CancellationToken, rt: &SinkRuntime, retry: &RetryPolicy) {
        let sink_name = rt.sink.name();

        let Ok(permit) = rt.breaker.check() else {
            debug!(sink = sink_name, "circuit open, skipping cycle");
            self.metrics
                .batches_failed
                .with_label_values(&[sink_name, "circuit_open"])
                .inc();
            self.record_breaker_gauge(rt);
            return;
        };

        let claimed = match self
            .spool
            .claim_batch(
                self.tunables.max_batch_size(),
                self.tunables.max_batch_bytes(),
                self.config.lease,
            )
            .await
        {
            Ok(claimed) => {
                self.spool_errors.store(0, Ordering::Relaxed);
                claimed
            }
            Err(e) => {
                // Transient for us: the next cycle retries the claim.
                warn!(sink = sink_name, error = %e, "spool claim failed");
                self.spool_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if claimed.is_empty() {
            // Dropping the unreported permit releases any half-open slot.
            drop(permit);
            return;
        }

        let ids: Vec<u64> = claimed.iter().map(|(id, _)| *id).collect();
        let envelopes: Vec<Envelope> = claimed.into_iter().map(|(_, e)| e).collect();

        let tokens = match self.config.rate_mode {
            RateMode::Events => envelopes.len() as u64,
            RateMode::Bytes => envelopes.iter().map(|e| e.approx_bytes() as u64).sum(),
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.spool.release(&ids).await;
                return;
            }
            _ = self.limiter.acquire(tokens, None) => {}
        }

        let batch = BatchEnvelope::build(&self.config.node_id, &envelopes);
        let started = std::time::Instant::now();
        let result = retry.run(cancel, |_| rt.sink.write(&batch)).await;
        let elapsed = started.elapsed();

        match result {
            Ok((receipt, attempts)) => {
                if let Err(e) = self.spool.commit(&ids).await {
                    // The batch was delivered; a failed commit means it will
                    // be redelivered after the lease expires (at-least-once).
                    warn!(sink = sink_name, error = %e, "commit failed after delivery");
                    self.spool_errors.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics
                    .batches_sent
                    .with_label_values(&[sink_name])
                    .inc();
                self.metrics
                    .events_sent
                    .with_label_values(&[sink_name])
                    .inc_by(receipt.events as u64);
                self.metrics
                    .bytes_sent
                    .with_label_values(&[sink_name])
                    .inc_by(receipt.bytes as u64);
                self.metrics
                    .retries
                    .with_label_values(&[sink_name])
                    .inc_by(u64::from(attempts.saturating_sub(1)));
                self.metrics
                    .send_duration
                    .with_label_values(&[sink_name])
                    .observe(elapsed.as_secs_f64());
                self.metrics
                    .batch_size_events
                    .with_label_values(&[sink_name])
                    .observe(receipt.events as f64);

                rt.breaker.record_success(permit);
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.batches_sent += 1;
                stats.events_sent += receipt.events as u64;
                stats.bytes_sent += receipt.bytes as u64;
                stats.last_success = Some(Utc::now());
                drop(stats);

                debug!(
                    sink = sink_name,
                    events = receipt.events,
                    bytes = receipt.bytes,
                    attempts,
                    "batch shipped"
                );
            }
            Err(RetryError::Cancelled) => {
                // Lease expiry also covers us if release itself fails.
                let _ = self.spool.release(&ids).await;
                drop(permit);
            }
            Err(terminal) => {
                let attempts = terminal.attempts();
                let kind = terminal.kind();
                let message = terminal.message();
                if let Err(e) = self.spool.fail(&ids, &message, true).await {
                    warn!(sink = sink_name, error = %e, "failed to dead-letter batch");
                    self.spool_errors.fetch_add(1, Ordering::Relaxed);
                }
                self.metrics
                    .batches_failed
                    .with_label_values(&[sink_name, kind])
                    .inc();
                self.metrics
                    .retries
                    .with_label_values(&[sink_name])
                    .inc_by(u64::from(attempts.saturating_sub(1)));
                self.metrics
                    .send_duration
                    .with_label_values(&[sink_name])
                    .observe(elapsed.as_secs_f64());

                rt.breaker.record_failure(permit);
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.batches_failed += 1;
                stats.last_failure = Some(Utc::now());
                drop(stats);

                error!(
                    sink = sink_name,
                    batch_size = ids.len(),
                    attempts,
                    last_error_kind = kind,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %message,
                    "batch failed terminally"
                );
            }
        }
        self.record_breaker_gauge(rt);
    }

    /// Shutdown drain: one final single-attempt batch per sink.
    async fn drain(&self) {
        debug!("shipper draining before shutdown");
        let detached = CancellationToken::new();
        for runtime in &self.sinks {
            let final_attempt = RetryPolicy {
                max_retries: 0,
                ..runtime.retry.clone()
            };
            self.ship_one(&detached, runtime, &final_attempt).await;
        }
        self.update_spool_gauges().await;
    }

    async fn housekeep(&self) {
        if let Err(e) = self.spool.reap_stale().await {
            warn!(error = %e, "periodic reap failed");
        }
        match self.spool.prune_dead(self.config.dead_retention).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, "pruned dead-letter records"),
            Err(e) => warn!(error = %e, "dead-letter prune failed"),
        }
        self.update_spool_gauges().await;
    }

    async fn claimable_count(&self) -> u64 {
        match self.spool.stats().await {
            Ok(stats) => stats.claimable(),
            Err(_) => 0,
        }
    }

    async fn update_spool_gauges(&self) {
        if let Ok(stats) = self.spool.stats().await {
            self.metrics.spool_pending.set(stats.claimable() as i64);
            self.metrics.spool_inflight.set(stats.in_flight as i64);
            self.metrics.spool_bytes.set(stats.total_bytes as i64);
        }
    }

    fn record_breaker_gauge(&self, rt: &SinkRuntime) {
        self.metrics
            .breaker_state
            .with_label_values(&[rt.sink.name()])
            .set(rt.breaker.state().as_gauge());
    }

    pub fn stats(&self) -> ShipperStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Degrades once the spool keeps erroring across cycles.
    pub fn healthy(&self) -> bool {
        self.spool_errors.load(Ordering::Relaxed) < SPOOL_ERROR_HEALTH_THRESHOLD
    }

    /// Reconfigure the outbound token bucket (SIGHUP reload path).
    pub fn reconfigure_rate_limit(&self, capacity: u64, refill_per_sec: f64) {
        self.limiter.reconfigure(capacity, refill_per_sec);
    }
}
