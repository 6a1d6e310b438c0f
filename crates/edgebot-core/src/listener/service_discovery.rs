//! Host service discovery: listening sockets and log-file candidates.
//!
//! Periodically enumerates listening TCP/UDP sockets from `/proc/net` and
//! probes a set of well-known log locations for readability, emitting one
//! `host_service_inventory` envelope per sweep. A pull source: a full spool
//! just skips the sweep, the next interval re-captures current state.

use super::{EnqueueHandle, Listener};
use crate::envelope::{Envelope, EventType};
use crate::error::SpoolError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOURCE: &str = "service_discovery";

/// TCP socket state code for LISTEN in `/proc/net/tcp`.
const TCP_LISTEN: u8 = 0x0a;

/// Well-known log locations worth tailing when present.
const COMMON_LOGS: &[&str] = &[
    "/var/log/nginx/access.log",
    "/var/log/nginx/error.log",
    "/var/log/dnsmasq.log",
    "/var/log/unbound/unbound.log",
    "/var/log/bind/bind.log",
    "/var/log/httpd/access_log",
    "/var/log/httpd/error_log",
];

pub struct ServiceDiscoveryListener {
    interval: Duration,
    extra_logs: Vec<PathBuf>,
    proc_root: PathBuf,
    running: AtomicBool,
}

impl ServiceDiscoveryListener {
    pub fn new(interval: Duration, extra_logs: Vec<PathBuf>) -> Self {
        Self::with_proc_root(interval, extra_logs, PathBuf::from("/proc"))
    }

    pub fn with_proc_root(
        interval: Duration,
        extra_logs: Vec<PathBuf>,
        proc_root: PathBuf,
    ) -> Self {
        ServiceDiscoveryListener {
            interval,
            extra_logs,
            proc_root,
            running: AtomicBool::new(false),
        }
    }

    fn inventory_envelope(&self) -> Envelope {
        let listeners = discover_listeners(&self.proc_root);
        let logs = discover_logs(&self.extra_logs);
        Envelope::new(EventType::HostServiceInventory, SOURCE)
            .with_payload_field("listeners", Value::Array(listeners))
            .with_payload_field(
                "log_candidates",
                json!(logs
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()),
            )
    }
}

#[async_trait]
impl Listener for ServiceDiscoveryListener {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError> {
        info!(interval_sec = self.interval.as_secs(), "service discovery started");
        self.running.store(true, Ordering::Release);

        // First sweep lands right away; subsequent ones follow the interval.
        let mut delay = Duration::from_millis(10);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("service discovery stopping");
                    self.running.store(false, Ordering::Release);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {
                    delay = self.interval;
                    match enqueue.enqueue(self.inventory_envelope()).await {
                        Ok(_) => {}
                        Err(SpoolError::CapacityExceeded) => {
                            debug!("spool full, skipping inventory sweep");
                        }
                        Err(SpoolError::Unavailable(reason)) => {
                            warn!(%reason, "spool unavailable, skipping inventory sweep");
                        }
                    }
                }
            }
        }
    }

    fn healthy(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Listening sockets from `/proc/net/{tcp,tcp6,udp,udp6}`. TCP entries are
/// filtered to LISTEN state; UDP sockets are reported as bound.
fn discover_listeners(proc_root: &Path) -> Vec<Value> {
    let mut results = Vec::new();
    for (file, proto, listen_only) in [
        ("net/tcp", "tcp", true),
        ("net/tcp6", "tcp6", true),
        ("net/udp", "udp", false),
        ("net/udp6", "udp6", false),
    ] {
        let path = proc_root.join(file);
        let Ok(table) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in table.lines().skip(1) {
            let Some(entry) = parse_socket_line(line, proto, listen_only) else {
                continue;
            };
            results.push(entry);
        }
    }
    results
}

/// One row of a `/proc/net` socket table:
/// `sl local_address rem_address st ...` with hex address and port.
fn parse_socket_line(line: &str, proto: &str, listen_only: bool) -> Option<Value> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;
    if listen_only && state != TCP_LISTEN {
        return None;
    }

    let (addr_hex, port_hex) = local.rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let address = match addr_hex.len() {
        // IPv4: hex of the kernel's little-endian u32.
        8 => {
            let raw = u32::from_str_radix(addr_hex, 16).ok()?;
            Ipv4Addr::from(raw.swap_bytes()).to_string()
        }
        // IPv6 stays in its raw hex form; decoding the grouped
        // representation buys nothing for inventory purposes.
        _ => addr_hex.to_ascii_lowercase(),
    };

    Some(json!({
        "proto": proto,
        "local": format!("{address}:{port}"),
    }))
}

/// Well-known plus configured log paths that exist and are readable.
fn discover_logs(extra: &[PathBuf]) -> Vec<PathBuf> {
    COMMON_LOGS
        .iter()
        .map(PathBuf::from)
        .chain(extra.iter().cloned())
        .filter(|p| p.is_file() && std::fs::File::open(p).is_ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::DEFAULT_CLOCK_SKEW_BOUND;
    use crate::metrics::Metrics;
    use crate::spool::{MemorySpool, Spool};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const TCP_TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
   1: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12346
   2: 0100007F:D431 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 12347
";

    const UDP_TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
   7: 00000000:14E9 00000000:0000 07 00000000:00000000 00:00000000 00000000   102        0 9876 2 0000000000000000 0
";

    fn fake_proc(dir: &TempDir) -> PathBuf {
        let net = dir.path().join("net");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::write(net.join("tcp"), TCP_TABLE).unwrap();
        std::fs::write(net.join("udp"), UDP_TABLE).unwrap();
        dir.path().to_path_buf()
    }

    #[test]
    fn parses_listening_sockets_only() {
        let dir = TempDir::new().unwrap();
        let proc_root = fake_proc(&dir);

        let listeners = discover_listeners(&proc_root);
        let locals: Vec<&str> = listeners
            .iter()
            .map(|l| l["local"].as_str().unwrap())
            .collect();
        // Two TCP LISTEN rows plus one bound UDP socket; the established
        // TCP connection is filtered out.
        assert_eq!(locals, vec!["127.0.0.1:8080", "0.0.0.0:80", "0.0.0.0:5353"]);
        assert_eq!(listeners[0]["proto"], json!("tcp"));
        assert_eq!(listeners[2]["proto"], json!("udp"));
    }

    #[test]
    fn discovers_readable_extra_logs() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "x\n").unwrap();
        let missing = dir.path().join("gone.log");

        let found = discover_logs(&[log.clone(), missing]);
        assert!(found.contains(&log));
        assert!(!found.iter().any(|p| p.ends_with("gone.log")));
    }

    #[tokio::test]
    async fn sweep_emits_inventory_envelope() {
        let dir = TempDir::new().unwrap();
        let proc_root = fake_proc(&dir);
        let log = dir.path().join("tailed.log");
        std::fs::write(&log, "x\n").unwrap();

        let spool: Arc<dyn Spool> = Arc::new(MemorySpool::new(100));
        let enqueue = EnqueueHandle::new(
            Arc::clone(&spool),
            Arc::new(Notify::new()),
            Metrics::new(),
            DEFAULT_CLOCK_SKEW_BOUND,
        );
        let listener = Arc::new(ServiceDiscoveryListener::with_proc_root(
            Duration::from_secs(300),
            vec![log.clone()],
            proc_root,
        ));

        let cancel = CancellationToken::new();
        let task = {
            let listener = Arc::clone(&listener);
            let cancel = cancel.clone();
            tokio::spawn(async move { listener.run(cancel, enqueue).await })
        };

        let mut claimed = Vec::new();
        for _ in 0..100 {
            claimed = spool
                .claim_batch(10, usize::MAX, Duration::from_secs(60))
                .await
                .unwrap();
            if !claimed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(claimed.len(), 1);
        let envelope = &claimed[0].1;
        assert_eq!(envelope.kind, EventType::HostServiceInventory);
        assert_eq!(envelope.payload["listeners"].as_array().unwrap().len(), 3);
        assert!(envelope.payload["log_candidates"]
            .as_array()
            .unwrap()
            .iter()
            .any(|p| p.as_str().unwrap().ends_with("tailed.log")));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
