//! File sink writing readable and gzipped payloads to a local directory.
//!
//! Each batch produces `payload-<utc-ms>-<6hex>.json` plus a byte-identical
//! `.json.gz`, both landed atomically (write a `.tmp` sibling, then rename).
//! Disk-full is permanent; everything else on the I/O path is transient.

use super::{Sink, WriteReceipt};
use crate::envelope::BatchEnvelope;
use crate::error::SinkError;
use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// errno for "no space left on device".
const ENOSPC: i32 = 28;

pub struct FileSink {
    dir: PathBuf,
    compression: bool,
}

impl FileSink {
    /// Accepts a `file://<dir>` URL or a bare path.
    pub fn from_url(url: &str, compression: bool) -> Result<Self, SinkError> {
        let path = url
            .strip_prefix("file://")
            .unwrap_or(url);
        if path.is_empty() {
            return Err(SinkError::permanent("file sink url has no path"));
        }
        Ok(FileSink {
            dir: PathBuf::from(path),
            compression,
        })
    }

    pub fn new(dir: impl Into<PathBuf>, compression: bool) -> Self {
        FileSink {
            dir: dir.into(),
            compression,
        }
    }

    fn batch_stem(&self) -> String {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let suffix: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
        format!("payload-{stamp}-{suffix:06x}")
    }

    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let target = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| classify_io(&tmp, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| classify_io(&target, e))?;
        Ok(())
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, batch: &BatchEnvelope) -> Result<WriteReceipt, SinkError> {
        if !self.dir.is_dir() {
            return Err(SinkError::permanent(format!(
                "output directory {:?} does not exist",
                self.dir
            )));
        }

        let json = serde_json::to_vec(batch)
            .map_err(|e| SinkError::permanent(format!("serialize batch: {e}")))?;

        let stem = self.batch_stem();
        self.write_atomic(&format!("{stem}.json"), &json).await?;

        if self.compression {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            let gz = encoder
                .write_all(&json)
                .and_then(|_| encoder.finish())
                .map_err(|e| SinkError::permanent(format!("gzip payload: {e}")))?;
            self.write_atomic(&format!("{stem}.json.gz"), &gz).await?;
        }

        info!(
            dir = %self.dir.display(),
            file = %format!("{stem}.json"),
            events = batch.batch_size,
            bytes = json.len(),
            "batch written to file sink"
        );

        Ok(WriteReceipt {
            events: batch.batch_size,
            bytes: json.len(),
        })
    }
}

fn classify_io(path: &Path, err: std::io::Error) -> SinkError {
    if err.raw_os_error() == Some(ENOSPC) {
        return SinkError::permanent(format!("disk full writing {path:?}: {err}"));
    }
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            SinkError::permanent(format!("write {path:?}: {err}"))
        }
        _ => SinkError::transient(format!("write {path:?}: {err}")),
    }
}
