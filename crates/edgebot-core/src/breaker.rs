//! Per-sink circuit breaker.
//!
//! State machine over `closed` -> `open` -> `half_open`. The breaker is
//! updated only on terminal results from the retry policy, never on
//! individual attempt failures. Admission hands out a [`BreakerPermit`];
//! dropping a permit without reporting an outcome releases the half-open
//! slot without a state transition (used when a claim turns out empty).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Breaker states, in gauge encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Encoding used by `edgebot_breaker_state`: 0 closed, 1 open, 2 half-open.
    pub fn as_gauge(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive terminal failures before opening.
    pub failure_threshold: u32,
    /// How long to reject before probing.
    pub open_duration: Duration,
    /// Concurrent probes admitted while half-open.
    pub half_open_max_inflight: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            half_open_max_inflight: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
}

/// A per-sink failure-count circuit.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_inflight: 0,
            })),
        }
    }

    /// Asks for admission. `Err(())` means the circuit is rejecting calls
    /// right now; the caller skips this cycle.
    pub fn check(&self) -> Result<BreakerPermit, ()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            BreakerState::Closed => Ok(self.permit(false)),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed < self.config.open_duration {
                    return Err(());
                }
                inner.state = BreakerState::HalfOpen;
                inner.half_open_inflight = 0;
                self.admit_half_open(&mut inner)
            }
            BreakerState::HalfOpen => self.admit_half_open(&mut inner),
        }
    }

    fn admit_half_open(&self, inner: &mut Inner) -> Result<BreakerPermit, ()> {
        if inner.half_open_inflight >= self.config.half_open_max_inflight {
            return Err(());
        }
        inner.half_open_inflight += 1;
        Ok(self.permit(true))
    }

    fn permit(&self, half_open: bool) -> BreakerPermit {
        BreakerPermit {
            inner: Arc::clone(&self.inner),
            half_open,
            resolved: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }
}

/// Admission token for one terminal call through the breaker.
pub struct BreakerPermit {
    inner: Arc<Mutex<Inner>>,
    half_open: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Report a terminal success. Half-open closes; closed resets the
    /// failure streak.
    pub fn success(mut self) {
        self.resolved = true;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.release_slot(&mut inner);
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
        }
    }

    /// Report a terminal failure. Half-open reopens immediately; closed
    /// opens once the streak reaches the threshold.
    pub fn failure(mut self, threshold: u32) {
        self.resolved = true;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.release_slot(&mut inner);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_failures = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.consecutive_failures = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    fn release_slot(&self, inner: &mut Inner) {
        if self.half_open {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // No outcome reported: release the slot without transitioning.
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.half_open {
            inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
        }
    }
}

/// Bundles a breaker with its threshold for call-site ergonomics.
pub struct SinkBreaker {
    breaker: CircuitBreaker,
    threshold: u32,
}

impl SinkBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let threshold = config.failure_threshold;
        SinkBreaker {
            breaker: CircuitBreaker::new(config),
            threshold,
        }
    }

    pub fn check(&self) -> Result<BreakerPermit, ()> {
        self.breaker.check()
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn record_success(&self, permit: BreakerPermit) {
        permit.success();
    }

    pub fn record_failure(&self, permit: BreakerPermit) {
        permit.failure(self.threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_millis(50),
            half_open_max_inflight: 2,
        }
    }

    fn fail_once(breaker: &SinkBreaker) {
        let permit = breaker.check().expect("admitted");
        breaker.record_failure(permit);
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let breaker = SinkBreaker::new(fast_config());
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail_once(&breaker);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn success_resets_streak() {
        let breaker = SinkBreaker::new(fast_config());
        fail_once(&breaker);
        fail_once(&breaker);
        let permit = breaker.check().unwrap();
        breaker.record_success(permit);
        fail_once(&breaker);
        fail_once(&breaker);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let breaker = SinkBreaker::new(fast_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        assert!(breaker.check().is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let probe = breaker.check().expect("probe admitted after open_duration");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success(probe);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = SinkBreaker::new(fast_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let probe = breaker.check().unwrap();
        breaker.record_failure(probe);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test]
    async fn half_open_caps_inflight_probes() {
        let breaker = SinkBreaker::new(fast_config());
        for _ in 0..3 {
            fail_once(&breaker);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let first = breaker.check().expect("first probe");
        let second = breaker.check().expect("second probe");
        assert!(breaker.check().is_err(), "third concurrent probe rejected");

        // Dropping without an outcome frees the slot without closing.
        drop(second);
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success(first);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn gauge_encoding() {
        assert_eq!(BreakerState::Closed.as_gauge(), 0);
        assert_eq!(BreakerState::Open.as_gauge(), 1);
        assert_eq!(BreakerState::HalfOpen.as_gauge(), 2);
    }
}
