//! Token-bucket gate on the outbound event or byte rate.
//!
//! One bucket per shipper. Refill is computed lazily from the wall-clock
//! delta on each call, so there is no background task. A token is one event
//! by default, or one byte in byte mode (see [`RateMode`]).

use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// What a token represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateMode {
    #[default]
    Events,
    Bytes,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Lazily-refilled token bucket.
///
/// Requests larger than the bucket capacity are clamped to the capacity so a
/// single oversized batch cannot stall the shipper forever.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        TokenBucket {
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                capacity: capacity as f64,
                refill_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes `n` tokens if available right now.
    pub fn try_acquire(&self, n: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let need = (n as f64).min(state.capacity);
        state.refill(Instant::now());
        if state.tokens >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Suspends until `n` tokens are available or `deadline` passes.
    /// Returns false only on deadline expiry.
    pub async fn acquire(&self, n: u64, deadline: Option<Instant>) -> bool {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let need = (n as f64).min(state.capacity);
                state.refill(Instant::now());
                if state.tokens >= need {
                    state.tokens -= need;
                    return true;
                }
                let missing = need - state.tokens;
                if state.refill_per_sec <= 0.0 {
                    // Never refills; only the deadline can end the wait.
                    Duration::from_millis(100)
                } else {
                    Duration::from_secs_f64(missing / state.refill_per_sec)
                }
            };

            let sleep_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    wait.min(deadline - now)
                }
                None => wait,
            };
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }

    /// Replaces capacity and refill rate in place; current fill is clamped
    /// to the new capacity. Used by SIGHUP tunable reload.
    pub fn reconfigure(&self, capacity: u64, refill_per_sec: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill(Instant::now());
        state.capacity = capacity as f64;
        state.refill_per_sec = refill_per_sec;
        state.tokens = state.tokens.min(state.capacity);
    }

    /// Current token count, for tests and diagnostics.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.refill(Instant::now());
        state.tokens
    }
}
