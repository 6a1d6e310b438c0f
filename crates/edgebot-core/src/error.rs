//! Error kinds shared across the data plane.
//!
//! Classification drives behavior: `SpoolError` is what producers and the
//! shipper see from the durable queue, `SinkError` is what a single write
//! attempt against a sink produces. The retry policy collapses per-attempt
//! `SinkError`s into a terminal outcome (see [`crate::retry`]).

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// The spool is at capacity. Lossy producers drop and count; pull
    /// producers back off.
    #[error("spool capacity exceeded")]
    CapacityExceeded,

    /// The underlying storage failed. The shipper treats this as transient
    /// and retries on its next cycle.
    #[error("spool unavailable: {0}")]
    Unavailable(String),
}

impl From<sled::Error> for SpoolError {
    fn from(err: sled::Error) -> Self {
        SpoolError::Unavailable(err.to_string())
    }
}

/// Outcome classification for a single sink write attempt.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Retryable: network errors, timeouts, 408/425/429/5xx. May carry a
    /// `Retry-After` hint from the remote.
    #[error("transient sink error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Not retryable: 4xx (except 429), TLS verification failure, local
    /// serialization failure, disk full.
    #[error("permanent sink error: {message}")]
    Permanent { message: String },
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        SinkError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient_with_hint(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        SinkError::Transient {
            message: message.into(),
            retry_after,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        SinkError::Permanent {
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SinkError::Permanent { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SinkError::Transient { retry_after, .. } => *retry_after,
            SinkError::Permanent { .. } => None,
        }
    }

    /// Short tag used as the `kind` label on failure counters.
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::Transient { .. } => "transient",
            SinkError::Permanent { .. } => "permanent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_error_classification() {
        let t = SinkError::transient("connection reset");
        assert!(!t.is_permanent());
        assert_eq!(t.kind(), "transient");
        assert_eq!(t.retry_after(), None);

        let hinted =
            SinkError::transient_with_hint("429", Some(Duration::from_secs(3)));
        assert_eq!(hinted.retry_after(), Some(Duration::from_secs(3)));

        let p = SinkError::permanent("400 bad request");
        assert!(p.is_permanent());
        assert_eq!(p.kind(), "permanent");
    }

    #[test]
    fn spool_error_display() {
        assert_eq!(
            SpoolError::CapacityExceeded.to_string(),
            "spool capacity exceeded"
        );
        assert!(SpoolError::Unavailable("io".into())
            .to_string()
            .contains("io"));
    }
}
