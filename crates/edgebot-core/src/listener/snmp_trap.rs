//! Raw SNMP trap/notification intake over UDP.
//!
//! Agents push traps unsolicited; each PDU is forwarded opaquely with the
//! agent address, size, and the base64 payload. BER/PDU decoding belongs to
//! a dedicated parser layer, and active GET polling needs that same codec,
//! so this adapter covers the push side only. Traps are fire-and-forget on
//! the wire, so spool backpressure means drop-and-count.

use super::{EnqueueHandle, Listener};
use crate::envelope::{Envelope, EventType};
use crate::error::SpoolError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SOURCE: &str = "snmp_trap";
const MAX_DATAGRAM: usize = 16_384;

pub struct SnmpTrapListener {
    bind: SocketAddr,
    bound: AtomicBool,
}

impl SnmpTrapListener {
    pub fn new(bind: SocketAddr) -> Self {
        SnmpTrapListener {
            bind,
            bound: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Listener for SnmpTrapListener {
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
        info!(bind = %self.bind, "snmp trap listener started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("snmp trap listener stopping");
                    self.bound.store(false, Ordering::Release);
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            enqueue.enqueue_or_drop(trap_envelope(&buf[..len], peer)).await;
                        }
                        Err(e) => {
                            debug!(error = %e, "snmp trap recv error");
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

fn trap_envelope(datagram: &[u8], peer: SocketAddr) -> Envelope {
    Envelope::new(EventType::SnmpMetric, SOURCE)
        .with_label("host", peer.ip().to_string())
        .with_payload_field("agent", json!(peer.ip().to_string()))
        .with_payload_field("agent_port", json!(peer.port()))
        .with_payload_field("size_bytes", json!(datagram.len()))
        .with_payload_field("payload_b64", json!(STANDARD.encode(datagram)))
}
