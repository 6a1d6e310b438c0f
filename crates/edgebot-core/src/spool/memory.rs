//! In-memory spool for ephemeral deployments.
//!
//! Same operations as the disk spool, without durability. Capacity is
//! counted in events (the `buffer.max_size` cap) rather than bytes; lossy
//! producers see `CapacityExceeded` once the cap is reached.

use super::{Spool, SpoolRecord, SpoolStats, SpoolStatus, DEFAULT_MAX_ATTEMPTS};
use crate::envelope::Envelope;
use crate::error::SpoolError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

struct Inner {
    next_id: u64,
    records: BTreeMap<u64, SpoolRecord>,
    total_bytes: u64,
}

pub struct MemorySpool {
    inner: Mutex<Inner>,
    max_events: usize,
    max_attempts: u32,
}

impl MemorySpool {
    pub fn new(max_events: usize) -> Self {
        Self::with_max_attempts(max_events, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_events: usize, max_attempts: u32) -> Self {
        MemorySpool {
            inner: Mutex::new(Inner {
                next_id: 1,
                records: BTreeMap::new(),
                total_bytes: 0,
            }),
            max_events,
            max_attempts,
        }
    }

    fn record_bytes(record: &SpoolRecord) -> u64 {
        serde_json::to_vec(record).map(|b| b.len() as u64).unwrap_or(0)
    }
}

#[async_trait]
impl Spool for MemorySpool {
    async fn enqueue(&self, mut envelope: Envelope) -> Result<u64, SpoolError> {
        let mut inner = self.inner.lock().await;
        let live = inner
            .records
            .values()
            .filter(|r| r.status != SpoolStatus::Dead)
            .count();
        if live >= self.max_events {
            return Err(SpoolError::CapacityExceeded);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        envelope.spool_id = Some(id);
        let record = SpoolRecord::new(envelope);
        inner.total_bytes += Self::record_bytes(&record);
        inner.records.insert(id, record);
        Ok(id)
    }

    async fn claim_batch(
        &self,
        max_count: usize,
        max_bytes: usize,
        lease: Duration,
    ) -> Result<Vec<(u64, Envelope)>, SpoolError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(150));

        let mut claimed = Vec::new();
        let mut claimed_bytes = 0usize;
        for (&id, record) in inner.records.iter_mut() {
            if !record.claimable(now) {
                continue;
            }
            let size = serde_json::to_vec(&record.envelope)
                .map(|b| b.len())
                .unwrap_or(0);
            if !claimed.is_empty() && claimed_bytes + size > max_bytes {
                break;
            }
            record.status = SpoolStatus::InFlight;
            record.claim_deadline = Some(deadline);
            claimed_bytes += size;
            claimed.push((id, record.envelope.clone()));
            if claimed.len() >= max_count {
                break;
            }
        }
        Ok(claimed)
    }

    async fn commit(&self, ids: &[u64]) -> Result<usize, SpoolError> {
        let mut inner = self.inner.lock().await;
        let mut deleted = 0;
        for id in ids {
            if let Some(record) = inner.records.remove(id) {
                let bytes = Self::record_bytes(&record);
                inner.total_bytes = inner.total_bytes.saturating_sub(bytes);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn fail(&self, ids: &[u64], error_text: &str, permanent: bool) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let max_attempts = self.max_attempts;
        let mut dead = 0u32;
        for id in ids {
            let Some(record) = inner.records.get_mut(id) else {
                continue;
            };
            record.envelope.attempts += 1;
            record.last_error = Some(error_text.to_string());
            record.last_attempt_at = Some(now);
            record.claim_deadline = None;
            if permanent || record.envelope.attempts >= max_attempts {
                record.status = SpoolStatus::Dead;
                dead += 1;
            } else {
                record.status = SpoolStatus::Pending;
            }
        }
        if dead > 0 {
            warn!(count = dead, "events dead-lettered in memory spool");
        }
        Ok(())
    }

    async fn release(&self, ids: &[u64]) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock().await;
        for id in ids {
            let Some(record) = inner.records.get_mut(id) else {
                continue;
            };
            if record.status == SpoolStatus::InFlight {
                record.status = SpoolStatus::Pending;
                record.claim_deadline = None;
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let inner = self.inner.lock().await;
        let mut stats = SpoolStats {
            total_bytes: inner.total_bytes,
            ..SpoolStats::default()
        };
        for record in inner.records.values() {
            match record.status {
                SpoolStatus::Pending => stats.pending += 1,
                SpoolStatus::InFlight => stats.in_flight += 1,
                SpoolStatus::Failed => stats.failed += 1,
                SpoolStatus::Dead => stats.dead += 1,
            }
        }
        Ok(stats)
    }

    async fn reap_stale(&self) -> Result<u64, SpoolError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut reaped = 0;
        for record in inner.records.values_mut() {
            let expired = record.status == SpoolStatus::InFlight
                && record
                    .claim_deadline
                    .map(|deadline| deadline < now)
                    .unwrap_or(true);
            if expired {
                record.status = SpoolStatus::Pending;
                record.claim_deadline = None;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn prune_dead(&self, older_than: Duration) -> Result<u64, SpoolError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::days(7));
        let doomed: Vec<u64> = inner
            .records
            .iter()
            .filter(|(_, record)| {
                record.status == SpoolStatus::Dead
                    && record.last_attempt_at.unwrap_or(record.enqueued_at) < cutoff
            })
            .map(|(&id, _)| id)
            .collect();
        let pruned = doomed.len() as u64;
        for id in doomed {
            if let Some(record) = inner.records.remove(&id) {
                let bytes = Self::record_bytes(&record);
                inner.total_bytes = inner.total_bytes.saturating_sub(bytes);
            }
        }
        Ok(pruned)
    }
}
