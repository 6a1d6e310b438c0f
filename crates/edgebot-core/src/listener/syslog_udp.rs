//! Raw syslog-over-UDP listener.
//!
//! Wraps each datagram as a `syslog`-typed envelope without interpreting the
//! wire format; RFC3164/5424 parsing belongs to a dedicated parser layer.
//! UDP is lossy by nature, so spool backpressure means drop-and-count.

use super::{EnqueueHandle, Listener};
use crate::envelope::{Envelope, EventType};
use crate::error::SpoolError;
use async_trait::async_trait;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SOURCE: &str = "syslog_udp";
const MAX_DATAGRAM: usize = 8192;

pub struct SyslogUdpListener {
    bind: SocketAddr,
    bound: AtomicBool,
}

impl SyslogUdpListener {
    pub fn new(bind: SocketAddr) -> Self {
        SyslogUdpListener {
            bind,
            bound: AtomicBool::new(false),
        }
    }

    fn envelope_for(&self, datagram: &[u8], peer: SocketAddr) -> Envelope {
        let message = String::from_utf8_lossy(datagram).trim_end().to_string();
        Envelope::new(EventType::Syslog, SOURCE)
            .with_label("host", peer.ip().to_string())
            .with_payload_field("message", json!(message))
            .with_payload_field("raw_len", json!(datagram.len()))
    }
}

#[async_trait]
impl Listener for SyslogUdpListener {
    fn name(&self) -> &str {
        SOURCE
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError> {
        let socket = UdpSocket::bind(self.bind)
            .await
            .map_err(|e| SpoolError::Unavailable(format!("bind {}: {e}", self.bind)))?;
        self.bound.store(true, Ordering::Release);
        info!(bind = %self.bind, "syslog udp listener started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("syslog udp listener stopping");
                    self.bound.store(false, Ordering::Release);
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let envelope = self.envelope_for(&buf[..len], peer);
                            enqueue.enqueue_or_drop(envelope).await;
                        }
                        Err(e) => {
                            // Transient socket errors are common under load;
                            // keep listening.
                            debug!(error = %e, "syslog udp recv error");
                        }
                    }
                }
            }
        }
    }

    fn healthy(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }
}
