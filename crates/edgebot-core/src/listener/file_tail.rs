//! File tailer: emits one `log_file` event per appended line.
//!
//! Polls explicit paths on an interval, tracking position and inode per
//! file. An inode change means rotation, a shrinking file means truncation;
//! both reopen from the start. A pull-style source: when the spool is full
//! it stops mid-scan and re-reads from the same position next cycle, so no
//! line is lost to backpressure.

use super::{EnqueueHandle, Listener};
use crate::envelope::{Envelope, EventType};
use crate::error::SpoolError;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on bytes consumed from one file per scan.
const READ_CAP: u64 = 256 * 1024;

#[derive(Debug)]
struct TailState {
    position: u64,
    file_id: u64,
}

pub struct FileTailListener {
    paths: Vec<PathBuf>,
    scan_interval: Duration,
    from_beginning: bool,
    running: AtomicBool,
}

impl FileTailListener {
    pub fn new(paths: Vec<PathBuf>, scan_interval: Duration, from_beginning: bool) -> Self {
        FileTailListener {
            paths,
            scan_interval,
            from_beginning,
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Listener for FileTailListener {
    fn name(&self) -> &str {
        "file_tail"
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError> {
        info!(paths = self.paths.len(), "file tailer started");
        self.running.store(true, Ordering::Release);
        let mut states: HashMap<PathBuf, TailState> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("file tailer stopping");
                    self.running.store(false, Ordering::Release);
                    return Ok(());
                }
                _ = tokio::time::sleep(self.scan_interval) => {
                    for path in &self.paths {
                        scan_file(path, self.from_beginning, &mut states, &enqueue).await;
                    }
                }
            }
        }
    }

    fn healthy(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// One poll of one file: register, detect rotation/truncation, read new
/// complete lines, enqueue each. Position only advances past lines that
/// made it into the spool.
async fn scan_file(
    path: &Path,
    from_beginning: bool,
    states: &mut HashMap<PathBuf, TailState>,
    enqueue: &EnqueueHandle,
) {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if states.remove(path).is_some() {
                info!(path = %path.display(), "stopped tailing missing file");
            }
            return;
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "stat failed");
            return;
        }
    };
    let current_id = file_id(&meta);

    let state = states.entry(path.to_path_buf()).or_insert_with(|| {
        info!(path = %path.display(), "tailing file");
        TailState {
            // New registrations skip the backlog unless configured otherwise.
            position: if from_beginning { 0 } else { meta.len() },
            file_id: current_id,
        }
    });

    if state.file_id != current_id || meta.len() < state.position {
        info!(path = %path.display(), "file rotated or truncated, reopening");
        state.position = 0;
        state.file_id = current_id;
    }
    if meta.len() <= state.position {
        return;
    }

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open file to tail");
            return;
        }
    };
    if let Err(e) = file.seek(SeekFrom::Start(state.position)).await {
        warn!(path = %path.display(), error = %e, "seek failed");
        return;
    }

    let mut buf = Vec::new();
    if let Err(e) = file.take(READ_CAP).read_to_end(&mut buf).await {
        warn!(path = %path.display(), error = %e, "read failed");
        return;
    }

    // Consume only complete lines; a partial tail waits for its newline.
    // A single line longer than the read cap is shipped as-is rather than
    // stalling the tailer.
    let consumed = match buf.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => last_newline + 1,
        None if buf.len() as u64 >= READ_CAP => buf.len(),
        None => return,
    };

    let source = format!("file:{}", path.display());
    let mut advanced = 0usize;
    for line in buf[..consumed].split(|&b| b == b'\n') {
        let offset = advanced + line.len() + 1;
        if line.is_empty() {
            advanced = offset.min(consumed);
            continue;
        }
        let text = String::from_utf8_lossy(line).into_owned();
        let envelope = Envelope::new(EventType::LogFile, source.clone())
            .with_payload_field("message", json!(text))
            .with_payload_field("path", json!(path.display().to_string()));
        match enqueue.enqueue(envelope).await {
            Ok(_) => advanced = offset.min(consumed),
            Err(SpoolError::CapacityExceeded) => {
                // Pull source: stop here, re-read from this line next scan.
                debug!(path = %path.display(), "spool full, pausing tail");
                break;
            }
            Err(SpoolError::Unavailable(reason)) => {
                warn!(path = %path.display(), %reason, "spool unavailable, pausing tail");
                break;
            }
        }
    }
    state.position += advanced as u64;
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> u64 {
    0
}
