//! Durable, ordered queue mediating listeners and the shipper.
//!
//! Producers `enqueue`; the single logical consumer claims batches under a
//! lease, then commits (delete) or fails (retry or dead-letter) them. The
//! disk implementation survives process restarts; the memory implementation
//! offers the same operations for ephemeral deployments.

mod disk;
mod memory;

pub use disk::{DiskSpool, DiskSpoolConfig};
pub use memory::MemorySpool;

use crate::envelope::Envelope;
use crate::error::SpoolError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delivery attempts after which a record is dead-lettered by `fail`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Lifecycle state of a spooled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpoolStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by the shipper; recoverable once `claim_deadline` passes.
    InFlight,
    /// Transient failure recorded; will be claimed again.
    Failed,
    /// Terminal; kept on disk for operator inspection until pruned.
    Dead,
}

/// On-storage record: the envelope plus queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub envelope: Envelope,
    pub status: SpoolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl SpoolRecord {
    pub fn new(envelope: Envelope) -> Self {
        SpoolRecord {
            envelope,
            status: SpoolStatus::Pending,
            claim_deadline: None,
            last_error: None,
            enqueued_at: Utc::now(),
            last_attempt_at: None,
        }
    }

    /// A record is claimable when pending, transiently failed, or in flight
    /// with an expired lease.
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SpoolStatus::Pending | SpoolStatus::Failed => true,
            SpoolStatus::InFlight => self
                .claim_deadline
                .map(|deadline| deadline < now)
                .unwrap_or(true),
            SpoolStatus::Dead => false,
        }
    }
}

/// Counts by status plus total stored bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolStats {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
    pub dead: u64,
    pub total_bytes: u64,
}

impl SpoolStats {
    /// Pending work from the shipper's point of view.
    pub fn claimable(&self) -> u64 {
        self.pending + self.failed
    }
}

/// The durable queue contract.
///
/// All operations are serialized internally; any task may `enqueue`, but only
/// the shipper may claim, commit, fail or release.
#[async_trait]
pub trait Spool: Send + Sync {
    /// Atomically appends an envelope, assigns the next `spool_id`, and
    /// persists it as pending. Durable before returning.
    async fn enqueue(&self, envelope: Envelope) -> Result<u64, SpoolError>;

    /// Returns up to `max_count` claimable records (bounded by `max_bytes`
    /// of stored size) in ascending `spool_id` order, moving each to
    /// in-flight with a lease. Non-blocking; empty when nothing is claimable.
    async fn claim_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
        lease: Duration,
    ) -> Result<Vec<(u64, Envelope)>, SpoolError>;

    /// Deletes the given records; ids already gone are ignored. Returns the
    /// number actually deleted.
    async fn commit(&self, ids: &[u64]) -> Result<usize, SpoolError>;

    /// Records a terminal attempt outcome. With `permanent`, or once the
    /// incremented attempt count reaches the configured maximum, the record
    /// moves to dead; otherwise it returns to pending with `attempts + 1`.
    async fn fail(&self, ids: &[u64], error: &str, permanent: bool) -> Result<(), SpoolError>;

    /// Reverts in-flight records to pending without touching `attempts`.
    /// Used when a claim is abandoned (circuit open, shutdown).
    async fn release(&self, ids: &[u64]) -> Result<(), SpoolError>;

    async fn stats(&self) -> Result<SpoolStats, SpoolError>;

    /// Reverts every in-flight record whose lease has expired to pending,
    /// without an attempt increment. Called on startup and periodically.
    async fn reap_stale(&self) -> Result<u64, SpoolError>;

    /// Deletes dead records older than the given age. Returns the count
    /// removed.
    async fn prune_dead(&self, older_than: Duration) -> Result<u64, SpoolError>;
}
