//! Listener adapter contract and the enqueue capability handed to listeners.
//!
//! A listener is a protocol-specific event producer. It never touches the
//! spool directly; it receives an [`EnqueueHandle`] that normalizes the
//! envelope, applies backpressure, counts drops, and wakes the shipper.

mod file_tail;
mod flows_udp;
mod nmea_udp;
mod service_discovery;
mod sim;
mod snmp_trap;
mod syslog_udp;
mod weather;

pub use file_tail::FileTailListener;
pub use flows_udp::FlowsUdpListener;
pub use nmea_udp::NmeaUdpListener;
pub use service_discovery::ServiceDiscoveryListener;
pub use sim::SimListener;
pub use snmp_trap::SnmpTrapListener;
pub use syslog_udp::SyslogUdpListener;
pub use weather::{WeatherConfig, WeatherPoller};

use crate::envelope::Envelope;
use crate::error::SpoolError;
use crate::metrics::Metrics;
use crate::spool::Spool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The capability a listener uses to hand events to the spool.
///
/// Cheap to clone; every clone signals the same shipper wakeup.
#[derive(Clone)]
pub struct EnqueueHandle {
    spool: Arc<dyn Spool>,
    signal: Arc<Notify>,
    metrics: Arc<Metrics>,
    clock_skew_bound: Duration,
}

impl EnqueueHandle {
    pub fn new(
        spool: Arc<dyn Spool>,
        signal: Arc<Notify>,
        metrics: Arc<Metrics>,
        clock_skew_bound: Duration,
    ) -> Self {
        EnqueueHandle {
            spool,
            signal,
            metrics,
            clock_skew_bound,
        }
    }

    /// Normalizes and enqueues. On success the shipper is woken. Capacity
    /// and storage errors surface to the listener, which decides whether to
    /// drop (lossy sources) or back off (pull sources).
    pub async fn enqueue(&self, mut envelope: Envelope) -> Result<u64, SpoolError> {
        let report = envelope.normalize(self.clock_skew_bound);
        let source = envelope.source.clone();
        if report.clock_clamped {
            warn!(source = %source, "event timestamp ahead of clock skew bound, clamped");
            self.metrics
                .events_dropped
                .with_label_values(&[source.as_str(), "clock_skew"])
                .inc();
        }
        if report.payload_truncated {
            self.metrics
                .events_dropped
                .with_label_values(&[source.as_str(), "payload_truncated"])
                .inc();
        }

        let id = self.spool.enqueue(envelope).await?;
        self.metrics
            .events_ingested
            .with_label_values(&[source.as_str()])
            .inc();
        self.signal.notify_one();
        Ok(id)
    }

    /// Lossy-source variant: spool-full becomes a counted drop instead of an
    /// error. Returns whether the event made it in.
    pub async fn enqueue_or_drop(&self, envelope: Envelope) -> bool {
        let source = envelope.source.clone();
        match self.enqueue(envelope).await {
            Ok(_) => true,
            Err(SpoolError::CapacityExceeded) => {
                self.metrics
                    .events_dropped
                    .with_label_values(&[source.as_str(), "spool_full"])
                    .inc();
                false
            }
            Err(SpoolError::Unavailable(reason)) => {
                warn!(source = %source, %reason, "spool unavailable, dropping event");
                self.metrics
                    .events_dropped
                    .with_label_values(&[source.as_str(), "spool_unavailable"])
                    .inc();
                false
            }
        }
    }
}

/// The contract each protocol-specific listener implements.
///
/// `run` owns the listener's lifetime: it returns when cancelled (clean) or
/// with an error (the supervisor restarts it). `healthy` is polled by the
/// health endpoint between restarts.
#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError>;

    fn healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventType, DEFAULT_CLOCK_SKEW_BOUND};
    use crate::spool::MemorySpool;
    use serde_json::json;

    fn handle(max_events: usize) -> (EnqueueHandle, Arc<Metrics>) {
        let metrics = Metrics::new();
        let handle = EnqueueHandle::new(
            Arc::new(MemorySpool::new(max_events)),
            Arc::new(Notify::new()),
            Arc::clone(&metrics),
            DEFAULT_CLOCK_SKEW_BOUND,
        );
        (handle, metrics)
    }

    fn event() -> Envelope {
        Envelope::new(EventType::Syslog, "syslog_udp").with_payload_field("message", json!("a"))
    }

    #[tokio::test]
    async fn counts_ingested() {
        let (handle, metrics) = handle(10);
        handle.enqueue(event()).await.unwrap();
        assert_eq!(
            metrics
                .events_ingested
                .with_label_values(&["syslog_udp"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn full_spool_drops_and_counts() {
        let (handle, metrics) = handle(100);
        let mut dropped = 0;
        for _ in 0..200 {
            if !handle.enqueue_or_drop(event()).await {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 100);
        assert_eq!(
            metrics
                .events_dropped
                .with_label_values(&["syslog_udp", "spool_full"])
                .get(),
            100
        );
        assert_eq!(
            metrics
                .events_ingested
                .with_label_values(&["syslog_udp"])
                .get(),
            100
        );
    }

    #[tokio::test]
    async fn clock_clamp_is_observable() {
        let (handle, metrics) = handle(10);
        let mut env = event();
        env.event_ts = env.received_at + chrono::Duration::days(3);
        handle.enqueue(env).await.unwrap();
        assert_eq!(
            metrics
                .events_dropped
                .with_label_values(&["syslog_udp", "clock_skew"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn signal_wakes_waiter() {
        let (handle, _metrics) = handle(10);
        let signal = Arc::clone(&handle.signal);
        let waiter = tokio::spawn(async move {
            signal.notified().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.enqueue(event()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woken")
            .unwrap();
    }
}
