//! Prometheus counters, gauges and histograms for the data plane.
//!
//! A single [`Metrics`] instance is created at startup and passed as an
//! explicit dependency to every component that records something. The
//! registry is exported verbatim by the `/metrics` endpoint.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

/// All counters and gauges the edge exports.
pub struct Metrics {
    pub registry: Registry,

    /// `edgebot_events_ingested_total{source}`
    pub events_ingested: IntCounterVec,
    /// `edgebot_events_dropped_total{source,reason}`
    pub events_dropped: IntCounterVec,
    /// `edgebot_batches_sent_total{sink}`
    pub batches_sent: IntCounterVec,
    /// `edgebot_events_sent_total{sink}`
    pub events_sent: IntCounterVec,
    /// `edgebot_batches_failed_total{sink,kind}`
    pub batches_failed: IntCounterVec,
    /// `edgebot_retries_total{sink}`
    pub retries: IntCounterVec,
    /// `edgebot_bytes_sent_total{sink}`
    pub bytes_sent: IntCounterVec,

    /// `edgebot_spool_pending`
    pub spool_pending: IntGauge,
    /// `edgebot_spool_inflight`
    pub spool_inflight: IntGauge,
    /// `edgebot_spool_bytes`
    pub spool_bytes: IntGauge,
    /// `edgebot_breaker_state{sink}`: 0 closed, 1 open, 2 half-open.
    pub breaker_state: IntGaugeVec,
    /// `edgebot_up`
    pub up: IntGauge,
    /// `edgebot_component_healthy{name}`
    pub component_healthy: IntGaugeVec,

    /// `edgebot_send_duration_seconds{sink}`
    pub send_duration: HistogramVec,
    /// `edgebot_batch_size_events{sink}`
    pub batch_size_events: HistogramVec,
}

impl Metrics {
    /// Builds and registers every metric on a fresh registry.
    ///
    /// Registration can only fail on duplicate or malformed metric names,
    /// which are fixed at compile time here.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
            let vec = IntCounterVec::new(Opts::new(name, help), labels)
                .expect("statically valid metric definition");
            registry
                .register(Box::new(vec.clone()))
                .expect("metric registered once");
            vec
        }

        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let g = IntGauge::new(name, help).expect("statically valid metric definition");
            registry
                .register(Box::new(g.clone()))
                .expect("metric registered once");
            g
        }

        fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
            let vec = IntGaugeVec::new(Opts::new(name, help), labels)
                .expect("statically valid metric definition");
            registry
                .register(Box::new(vec.clone()))
                .expect("metric registered once");
            vec
        }

        let events_ingested = counter(
            &registry,
            "edgebot_events_ingested_total",
            "Events accepted into the spool",
            &["source"],
        );
        let events_dropped = counter(
            &registry,
            "edgebot_events_dropped_total",
            "Events dropped or clamped before shipping",
            &["source", "reason"],
        );
        let batches_sent = counter(
            &registry,
            "edgebot_batches_sent_total",
            "Batches acknowledged by a sink",
            &["sink"],
        );
        let events_sent = counter(
            &registry,
            "edgebot_events_sent_total",
            "Events acknowledged by a sink",
            &["sink"],
        );
        let batches_failed = counter(
            &registry,
            "edgebot_batches_failed_total",
            "Batches that reached a terminal failure",
            &["sink", "kind"],
        );
        let retries = counter(
            &registry,
            "edgebot_retries_total",
            "Send attempts beyond the first, per sink",
            &["sink"],
        );
        let bytes_sent = counter(
            &registry,
            "edgebot_bytes_sent_total",
            "Payload bytes acknowledged by a sink",
            &["sink"],
        );

        let spool_pending = gauge(&registry, "edgebot_spool_pending", "Spooled events pending");
        let spool_inflight = gauge(
            &registry,
            "edgebot_spool_inflight",
            "Spooled events claimed by the shipper",
        );
        let spool_bytes = gauge(&registry, "edgebot_spool_bytes", "On-disk spool size in bytes");
        let breaker_state = gauge_vec(
            &registry,
            "edgebot_breaker_state",
            "Circuit breaker state: 0 closed, 1 open, 2 half-open",
            &["sink"],
        );
        let up = gauge(&registry, "edgebot_up", "1 while the process is running");
        let component_healthy = gauge_vec(
            &registry,
            "edgebot_component_healthy",
            "1 while the named component reports healthy",
            &["name"],
        );

        let send_duration = HistogramVec::new(
            HistogramOpts::new(
                "edgebot_send_duration_seconds",
                "Wall time of terminal batch sends, including retries",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["sink"],
        )
        .expect("statically valid metric definition");
        registry
            .register(Box::new(send_duration.clone()))
            .expect("metric registered once");

        let batch_size_events = HistogramVec::new(
            HistogramOpts::new(
                "edgebot_batch_size_events",
                "Events per shipped batch",
            )
            .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
            &["sink"],
        )
        .expect("statically valid metric definition");
        registry
            .register(Box::new(batch_size_events.clone()))
            .expect("metric registered once");

        up.set(1);

        Arc::new(Metrics {
            registry,
            events_ingested,
            events_dropped,
            batches_sent,
            events_sent,
            batches_failed,
            retries,
            bytes_sent,
            spool_pending,
            spool_inflight,
            spool_bytes,
            breaker_state,
            up,
            component_healthy,
            send_duration,
            batch_size_events,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("failed to encode metrics: {err}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
