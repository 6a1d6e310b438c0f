//! Sled-backed durable spool.
//!
//! Records live in a single tree keyed by a big-endian monotonic id, so an
//! ordered scan is delivery order. Every mutation holds the spool mutex and
//! flushes before returning, which makes enqueue/commit/fail durable ahead
//! of any user-visible acknowledgement. A crash between claim and commit
//! leaves records in flight; `reap_stale` reverts them on the next startup.

use super::{Spool, SpoolRecord, SpoolStats, SpoolStatus, DEFAULT_MAX_ATTEMPTS};
use crate::envelope::Envelope;
use crate::error::SpoolError;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

const SPOOL_DB: &str = "spool.db";
const LOCK_FILE: &str = "spool.db.lock";
const DEAD_DIR: &str = "dead";
const RECORDS_TREE: &str = "records";

#[derive(Debug, Clone)]
pub struct DiskSpoolConfig {
    /// On-disk budget; enqueue fails `CapacityExceeded` beyond it.
    pub max_bytes: u64,
    /// Attempt count at which `fail` dead-letters instead of requeueing.
    pub max_attempts: u32,
    /// Write a JSON export of each dead-lettered event under `dead/`.
    pub export_dead: bool,
}

impl Default for DiskSpoolConfig {
    fn default() -> Self {
        DiskSpoolConfig {
            max_bytes: 100 * 1024 * 1024,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            export_dead: true,
        }
    }
}

struct Inner {
    total_bytes: u64,
}

/// Durable spool over a single sled tree, single-process, single-writer.
pub struct DiskSpool {
    db: sled::Db,
    records: sled::Tree,
    inner: Mutex<Inner>,
    config: DiskSpoolConfig,
    lock_path: PathBuf,
    dead_dir: PathBuf,
}

impl DiskSpool {
    /// Opens (or creates) the spool under `state_dir`, taking the advisory
    /// lock. A lock held by a live process fails with `Unavailable`; a
    /// stale lock from a dead process is taken over with a warning.
    pub fn open(state_dir: &Path, config: DiskSpoolConfig) -> Result<Self, SpoolError> {
        std::fs::create_dir_all(state_dir)
            .map_err(|e| SpoolError::Unavailable(format!("create {state_dir:?}: {e}")))?;

        let lock_path = state_dir.join(LOCK_FILE);
        acquire_lock(&lock_path)?;

        let dead_dir = state_dir.join(DEAD_DIR);
        if config.export_dead {
            std::fs::create_dir_all(&dead_dir)
                .map_err(|e| SpoolError::Unavailable(format!("create {dead_dir:?}: {e}")))?;
        }

        let db = sled::Config::new()
            .path(state_dir.join(SPOOL_DB))
            .open()
            .map_err(|e| {
                let _ = std::fs::remove_file(&lock_path);
                SpoolError::Unavailable(format!("open spool db: {e}"))
            })?;
        let records = db.open_tree(RECORDS_TREE)?;

        let mut total_bytes = 0u64;
        for entry in records.iter() {
            let (_, value) = entry?;
            total_bytes += value.len() as u64;
        }
        debug!(total_bytes, records = records.len(), "spool opened");

        Ok(DiskSpool {
            db,
            records,
            inner: Mutex::new(Inner { total_bytes }),
            config,
            lock_path,
            dead_dir,
        })
    }

    fn key(id: u64) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn id_from_key(key: &[u8]) -> Option<u64> {
        key.try_into().ok().map(u64::from_be_bytes)
    }

    fn decode(value: &[u8]) -> Result<SpoolRecord, serde_json::Error> {
        serde_json::from_slice(value)
    }

    fn encode(record: &SpoolRecord) -> Result<Vec<u8>, SpoolError> {
        serde_json::to_vec(record)
            .map_err(|e| SpoolError::Unavailable(format!("encode spool record: {e}")))
    }

    /// Rewrites one record in place, keeping the byte ledger consistent.
    fn replace(
        &self,
        inner: &mut Inner,
        id: u64,
        old_len: usize,
        record: &SpoolRecord,
    ) -> Result<(), SpoolError> {
        let bytes = Self::encode(record)?;
        let new_len = bytes.len() as u64;
        self.records.insert(Self::key(id), bytes)?;
        inner.total_bytes = inner.total_bytes.saturating_sub(old_len as u64) + new_len;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SpoolError> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(SpoolError::from)
    }

    fn export_dead_record(&self, id: u64, record: &SpoolRecord, reason: &str) {
        if !self.config.export_dead {
            return;
        }
        let body = serde_json::json!({
            "event": record.envelope,
            "reason": reason,
            "attempts": record.envelope.attempts,
            "dead_at": Utc::now(),
            "event_sha256": content_digest(&record.envelope),
        });
        let path = self
            .dead_dir
            .join(format!("dead-{id}-{}.json", Utc::now().timestamp_millis()));
        if let Err(e) = std::fs::write(&path, serde_json::to_vec_pretty(&body).unwrap_or_default())
        {
            warn!(?path, error = %e, "failed to export dead-lettered event");
        }
    }
}

impl Drop for DiskSpool {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[async_trait]
impl Spool for DiskSpool {
    async fn enqueue(&self, mut envelope: Envelope) -> Result<u64, SpoolError> {
        let mut inner = self.inner.lock().await;

        let id = self.db.generate_id()?;
        envelope.spool_id = Some(id);
        let record = SpoolRecord::new(envelope);
        let bytes = Self::encode(&record)?;

        if inner.total_bytes + bytes.len() as u64 > self.config.max_bytes {
            return Err(SpoolError::CapacityExceeded);
        }

        self.records.insert(Self::key(id), bytes.clone())?;
        inner.total_bytes += bytes.len() as u64;
        drop(inner);

        self.flush().await?;
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
        let mut corrupt = Vec::new();

        for entry in self.records.iter() {
            let (key, value) = entry?;
            let Some(id) = Self::id_from_key(&key) else {
                continue;
            };
            let mut record = match Self::decode(&value) {
                Ok(record) => record,
                Err(e) => {
                    error!(id, error = %e, "dropping undecodable spool record");
                    corrupt.push((id, value.len()));
                    continue;
                }
            };
            if !record.claimable(now) {
                continue;
            }
            if !claimed.is_empty() && claimed_bytes + value.len() > max_bytes {
                break;
            }

            record.status = SpoolStatus::InFlight;
            record.claim_deadline = Some(deadline);
            self.replace(&mut inner, id, value.len(), &record)?;

            claimed_bytes += value.len();
            claimed.push((id, record.envelope));
            if claimed.len() >= max_count {
                break;
            }
        }

        for (id, len) in corrupt {
            self.records.remove(Self::key(id))?;
            inner.total_bytes = inner.total_bytes.saturating_sub(len as u64);
        }

        drop(inner);
        if !claimed.is_empty() {
            self.flush().await?;
        }
        Ok(claimed)
    }

    async fn commit(&self, ids: &[u64]) -> Result<usize, SpoolError> {
        let mut inner = self.inner.lock().await;
        let mut deleted = 0;
        for &id in ids {
            if let Some(value) = self.records.remove(Self::key(id))? {
                inner.total_bytes = inner.total_bytes.saturating_sub(value.len() as u64);
                deleted += 1;
            }
        }
        drop(inner);
        if deleted > 0 {
            self.flush().await?;
        }
        Ok(deleted)
    }

    async fn fail(&self, ids: &[u64], error_text: &str, permanent: bool) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut dead = 0u32;

        for &id in ids {
            let Some(value) = self.records.get(Self::key(id))? else {
                continue;
            };
            let mut record = match Self::decode(&value) {
                Ok(record) => record,
                Err(e) => {
                    error!(id, error = %e, "failing undecodable spool record");
                    self.records.remove(Self::key(id))?;
                    inner.total_bytes = inner.total_bytes.saturating_sub(value.len() as u64);
                    continue;
                }
            };

            record.envelope.attempts += 1;
            record.last_error = Some(truncate_error(error_text));
            record.last_attempt_at = Some(now);
            record.claim_deadline = None;

            if permanent || record.envelope.attempts >= self.config.max_attempts {
                record.status = SpoolStatus::Dead;
                self.export_dead_record(id, &record, error_text);
                dead += 1;
            } else {
                record.status = SpoolStatus::Pending;
            }
            self.replace(&mut inner, id, value.len(), &record)?;
        }

        drop(inner);
        if dead > 0 {
            debug!(count = dead, "events moved to dead-letter");
        }
        self.flush().await
    }

    async fn release(&self, ids: &[u64]) -> Result<(), SpoolError> {
        let mut inner = self.inner.lock().await;
        for &id in ids {
            let Some(value) = self.records.get(Self::key(id))? else {
                continue;
            };
            let Ok(mut record) = Self::decode(&value) else {
                continue;
            };
            if record.status != SpoolStatus::InFlight {
                continue;
            }
            record.status = SpoolStatus::Pending;
            record.claim_deadline = None;
            self.replace(&mut inner, id, value.len(), &record)?;
        }
        drop(inner);
        self.flush().await
    }

    async fn stats(&self) -> Result<SpoolStats, SpoolError> {
        let inner = self.inner.lock().await;
        let mut stats = SpoolStats {
            total_bytes: inner.total_bytes,
            ..SpoolStats::default()
        };
        for entry in self.records.iter() {
            let (_, value) = entry?;
            let Ok(record) = Self::decode(&value) else {
                continue;
            };
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
        let mut reaped = 0u64;

        for entry in self.records.iter() {
            let (key, value) = entry?;
            let Some(id) = Self::id_from_key(&key) else {
                continue;
            };
            let Ok(mut record) = Self::decode(&value) else {
                continue;
            };
            let expired = record.status == SpoolStatus::InFlight
                && record
                    .claim_deadline
                    .map(|deadline| deadline < now)
                    .unwrap_or(true);
            if !expired {
                continue;
            }
            record.status = SpoolStatus::Pending;
            record.claim_deadline = None;
            self.replace(&mut inner, id, value.len(), &record)?;
            reaped += 1;
        }

        drop(inner);
        if reaped > 0 {
            warn!(reaped, "recovered stale in-flight records");
            self.flush().await?;
        }
        Ok(reaped)
    }

    async fn prune_dead(&self, older_than: Duration) -> Result<u64, SpoolError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::days(7));
        let mut pruned = 0u64;

        for entry in self.records.iter() {
            let (key, value) = entry?;
            let Some(id) = Self::id_from_key(&key) else {
                continue;
            };
            let Ok(record) = Self::decode(&value) else {
                continue;
            };
            if record.status != SpoolStatus::Dead {
                continue;
            }
            let aged_out = record
                .last_attempt_at
                .unwrap_or(record.enqueued_at)
                < cutoff;
            if !aged_out {
                continue;
            }
            self.records.remove(Self::key(id))?;
            inner.total_bytes = inner.total_bytes.saturating_sub(value.len() as u64);
            pruned += 1;
        }

        drop(inner);
        if pruned > 0 {
            debug!(pruned, "pruned aged dead-letter records");
            self.flush().await?;
        }
        Ok(pruned)
    }
}

/// Takes the advisory lock, handling stale locks from dead processes.
fn acquire_lock(lock_path: &Path) -> Result<(), SpoolError> {
    if let Ok(existing) = std::fs::read_to_string(lock_path) {
        let pid = existing.trim().parse::<u32>().ok();
        match pid {
            Some(pid) if pid == std::process::id() => {
                return Err(SpoolError::Unavailable(
                    "spool already open in this process".to_string(),
                ));
            }
            Some(pid) if process_alive(pid) => {
                return Err(SpoolError::Unavailable(format!(
                    "spool locked by running pid {pid}"
                )));
            }
            Some(pid) => {
                warn!(stale_pid = pid, "taking over stale spool lock");
            }
            None => {
                warn!(?lock_path, "taking over unreadable spool lock");
            }
        }
    }
    std::fs::write(lock_path, std::process::id().to_string())
        .map_err(|e| SpoolError::Unavailable(format!("write lock file: {e}")))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // No portable liveness probe; assume the holder is gone and take over.
    false
}

fn truncate_error(text: &str) -> String {
    const MAX: usize = 512;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut end = MAX;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text[..end].to_string()
    }
}

fn content_digest(envelope: &Envelope) -> String {
    let bytes = serde_json::to_vec(envelope).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(&hasher.finalize()[..8])
}
