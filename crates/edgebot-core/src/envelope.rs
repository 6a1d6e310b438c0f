//! Uniform event envelope and normalization rules.
//!
//! Every event that crosses the spool boundary is an [`Envelope`]. Listeners
//! construct one, [`Envelope::normalize`] enforces the envelope contract
//! (timestamp clamping, label bounds, payload size cap, tag character set),
//! and the spool assigns `spool_id` on enqueue. Outbound batches carry the
//! sanitized form only: `spool_id`, `attempts` and every `__`-prefixed key
//! are stripped before a byte leaves the node.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound on each label key and value, in bytes.
pub const MAX_LABEL_BYTES: usize = 128;

/// Upper bound on the serialized payload, in bytes. Oversize payloads are
/// replaced by a truncation marker carrying a digest of the original.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Default bound on how far ahead of `received_at` a source timestamp may be.
pub const DEFAULT_CLOCK_SKEW_BOUND: Duration = Duration::from_secs(24 * 60 * 60);

/// Short tag describing what kind of event this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Syslog,
    SnmpMetric,
    Weather,
    LogFile,
    Nmea,
    Flow,
    HostServiceInventory,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Syslog => "syslog",
            EventType::SnmpMetric => "snmp_metric",
            EventType::Weather => "weather",
            EventType::LogFile => "log_file",
            EventType::Nmea => "nmea",
            EventType::Flow => "flow",
            EventType::HostServiceInventory => "host_service_inventory",
            EventType::Other => "other",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The uniform per-event record used across the core.
///
/// `spool_id` and `attempts` are internal bookkeeping and never serialized
/// outbound; they ride along here so the shipper can commit or fail the
/// exact records it claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Assigned by the spool on enqueue; never leaves the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spool_id: Option<u64>,

    /// Wall-clock at normalization, millisecond precision.
    pub received_at: DateTime<Utc>,

    /// The source's own timestamp when available, else `received_at`.
    pub event_ts: DateTime<Utc>,

    #[serde(rename = "type")]
    pub kind: EventType,

    /// Identifies the listener instance, e.g. `syslog_udp` or
    /// `file:/var/log/nginx/access.log`.
    pub source: String,

    /// Small set of short labels: `host`, `service`, `severity`, `site`, `env`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Parser-specific fields; opaque to the core.
    #[serde(default)]
    pub payload: Map<String, Value>,

    /// Count of prior send attempts.
    #[serde(default)]
    pub attempts: u32,
}

/// What [`Envelope::normalize`] had to do to make the event conformant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    /// `event_ts` exceeded `received_at + skew_bound` and was clamped.
    pub clock_clamped: bool,
    /// The payload exceeded [`MAX_PAYLOAD_BYTES`] and was replaced by a marker.
    pub payload_truncated: bool,
}

impl Envelope {
    /// Builds an envelope stamped "now". `event_ts` defaults to `received_at`
    /// until the caller supplies a source timestamp.
    pub fn new(kind: EventType, source: impl Into<String>) -> Self {
        let now = Utc::now().trunc_subsecs(3);
        Envelope {
            spool_id: None,
            received_at: now,
            event_ts: now,
            kind,
            source: source.into(),
            labels: BTreeMap::new(),
            payload: Map::new(),
            attempts: 0,
        }
    }

    pub fn with_event_ts(mut self, event_ts: DateTime<Utc>) -> Self {
        self.event_ts = event_ts.trunc_subsecs(3);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_payload_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Enforces the envelope contract in place.
    ///
    /// - timestamps truncated to millisecond precision
    /// - `event_ts` clamped to `received_at` when it runs ahead of the skew bound
    /// - `source` and `labels.severity` restricted to their tag character sets
    /// - label keys and values capped at [`MAX_LABEL_BYTES`]
    /// - oversize payloads replaced by a `__truncated` marker with a SHA-256
    ///   digest of the original bytes
    pub fn normalize(&mut self, skew_bound: Duration) -> NormalizeReport {
        let mut report = NormalizeReport::default();

        self.received_at = self.received_at.trunc_subsecs(3);
        self.event_ts = self.event_ts.trunc_subsecs(3);

        let bound = chrono::Duration::from_std(skew_bound)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        if self.event_ts > self.received_at + bound {
            self.event_ts = self.received_at;
            report.clock_clamped = true;
        }

        self.source = sanitize_tag(&self.source, true);

        let labels = std::mem::take(&mut self.labels);
        for (key, value) in labels {
            let key = truncate_utf8(&key, MAX_LABEL_BYTES);
            let mut value = truncate_utf8(&value, MAX_LABEL_BYTES);
            if key == "severity" {
                value = sanitize_tag(&value, false);
            }
            self.labels.insert(key, value);
        }

        let payload_bytes =
            serde_json::to_vec(&self.payload).map(|b| b.len()).unwrap_or(0);
        if payload_bytes > MAX_PAYLOAD_BYTES {
            let digest = payload_digest(&self.payload);
            let mut marker = Map::new();
            marker.insert("__truncated".into(), Value::Bool(true));
            marker.insert("__payload_sha256".into(), Value::String(digest));
            marker.insert(
                "__payload_bytes".into(),
                Value::Number(serde_json::Number::from(payload_bytes)),
            );
            self.payload = marker;
            report.payload_truncated = true;
        }

        report
    }

    /// The outbound representation: the full envelope minus `spool_id`,
    /// `attempts` and every `__`-prefixed key, recursively through maps.
    pub fn sanitized(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.remove("spool_id");
            map.remove("attempts");
        }
        strip_internal_keys(&mut value);
        value
    }

    /// Serialized size of this envelope, used for byte-mode rate limiting
    /// and batch byte caps.
    pub fn approx_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}

/// The JSON object a sink actually transmits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEnvelope {
    /// Sanitized events in `spool_id` order.
    pub messages: Vec<Value>,
    pub batch_size: usize,
    /// Epoch seconds at batch creation.
    pub timestamp: i64,
    /// The edge node's identity string.
    pub source: String,
    /// True iff any message in the batch has a prior send attempt.
    pub is_retry: bool,
}

impl BatchEnvelope {
    pub fn build(node_id: &str, events: &[Envelope]) -> Self {
        let is_retry = events.iter().any(|e| e.attempts > 0);
        BatchEnvelope {
            messages: events.iter().map(Envelope::sanitized).collect(),
            batch_size: events.len(),
            timestamp: Utc::now().timestamp(),
            source: node_id.to_string(),
            is_retry,
        }
    }
}

/// Restricts a tag to `[a-z0-9_.-]` (plus `:` and `/` when `allow_path`,
/// so sources like `file:/var/log/nginx/access.log` survive). Uppercase is
/// folded, anything else becomes `_`.
fn sanitize_tag(tag: &str, allow_path: bool) -> String {
    tag.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            ':' | '/' if allow_path => c,
            _ => '_',
        })
        .collect()
}

/// Truncates to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn payload_digest(payload: &Map<String, Value>) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Removes every key beginning with `__` from this value and all nested maps.
fn strip_internal_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with("__"));
            for nested in map.values_mut() {
                strip_internal_keys(nested);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_internal_keys(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::new(EventType::Syslog, "syslog_udp")
            .with_label("host", "edge-01")
            .with_label("severity", "WARNING!")
            .with_payload_field("message", json!("a"))
    }

    #[test]
    fn event_type_tags() {
        assert_eq!(EventType::SnmpMetric.as_str(), "snmp_metric");
        assert_eq!(
            serde_json::to_string(&EventType::HostServiceInventory).unwrap(),
            "\"host_service_inventory\""
        );
        let parsed: EventType = serde_json::from_str("\"log_file\"").unwrap();
        assert_eq!(parsed, EventType::LogFile);
    }

    #[test]
    fn normalize_clamps_future_event_ts() {
        let mut env = sample();
        env.event_ts = env.received_at + chrono::Duration::hours(48);
        let report = env.normalize(DEFAULT_CLOCK_SKEW_BOUND);
        assert!(report.clock_clamped);
        assert_eq!(env.event_ts, env.received_at);
    }

    #[test]
    fn normalize_keeps_past_event_ts() {
        let mut env = sample();
        let old = env.received_at - chrono::Duration::days(30);
        env.event_ts = old;
        let report = env.normalize(DEFAULT_CLOCK_SKEW_BOUND);
        assert!(!report.clock_clamped);
        assert_eq!(env.event_ts, old);
    }

    #[test]
    fn normalize_sanitizes_tags() {
        let mut env = sample();
        env.source = "File:/Var/Log/App Log".into();
        env.normalize(DEFAULT_CLOCK_SKEW_BOUND);
        assert_eq!(env.source, "file:/var/log/app_log");
        assert_eq!(env.labels.get("severity").unwrap(), "warning_");
    }

    #[test]
    fn normalize_bounds_labels() {
        let mut env = sample();
        env.labels.insert("site".into(), "x".repeat(500));
        env.normalize(DEFAULT_CLOCK_SKEW_BOUND);
        assert_eq!(env.labels.get("site").unwrap().len(), MAX_LABEL_BYTES);
    }

    #[test]
    fn normalize_truncates_oversize_payload() {
        let mut env = sample();
        env.payload.insert(
            "blob".into(),
            Value::String("y".repeat(MAX_PAYLOAD_BYTES + 1)),
        );
        let report = env.normalize(DEFAULT_CLOCK_SKEW_BOUND);
        assert!(report.payload_truncated);
        assert_eq!(env.payload.get("__truncated"), Some(&Value::Bool(true)));
        assert!(env.payload.contains_key("__payload_sha256"));
        assert!(!env.payload.contains_key("blob"));
    }

    #[test]
    fn sanitized_strips_internals() {
        let mut env = sample();
        env.spool_id = Some(42);
        env.attempts = 3;
        env.payload
            .insert("__spool_marker".into(), Value::Bool(true));
        env.payload
            .insert("nested".into(), json!({"__hidden": 1, "kept": 2}));

        let clean = env.sanitized();
        let obj = clean.as_object().unwrap();
        assert!(!obj.contains_key("spool_id"));
        assert!(!obj.contains_key("attempts"));
        let payload = obj.get("payload").unwrap().as_object().unwrap();
        assert!(!payload.contains_key("__spool_marker"));
        let nested = payload.get("nested").unwrap().as_object().unwrap();
        assert!(!nested.contains_key("__hidden"));
        assert_eq!(nested.get("kept"), Some(&json!(2)));
    }

    #[test]
    fn batch_envelope_shape() {
        let mut a = sample();
        a.spool_id = Some(1);
        let mut b = sample();
        b.spool_id = Some(2);
        b.attempts = 1;

        let batch = BatchEnvelope::build("edge-01", &[a, b]);
        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.source, "edge-01");
        assert!(batch.is_retry);
        assert!(batch.timestamp > 0);

        let raw = serde_json::to_string(&batch).unwrap();
        assert!(!raw.contains("spool_id"));
        assert!(!raw.contains("attempts"));
        assert!(!raw.contains("__"));
    }

    #[test]
    fn batch_envelope_not_retry_for_fresh_events() {
        let batch = BatchEnvelope::build("edge-01", &[sample()]);
        assert!(!batch.is_retry);
    }

    #[test]
    fn spool_round_trip_preserves_internals() {
        let mut env = sample();
        env.spool_id = Some(7);
        env.attempts = 2;
        let raw = serde_json::to_vec(&env).unwrap();
        let back: Envelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.spool_id, Some(7));
        assert_eq!(back.attempts, 2);
        assert_eq!(back.kind, EventType::Syslog);
    }
}
