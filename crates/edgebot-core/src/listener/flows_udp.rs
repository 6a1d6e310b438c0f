//! Raw flow-export listener for NetFlow, IPFIX and sFlow datagrams.
//!
//! Forwards each export packet opaquely: the version word is peeked to tag
//! the packet, sizes and exporter address are recorded, and the payload
//! rides along base64-encoded. Header and record decoding belong to a
//! dedicated parser layer. Flow exports are lossy by nature, so spool
//! backpressure means drop-and-count.

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
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SOURCE: &str = "flows_udp";
const MAX_DATAGRAM: usize = 65_535;

/// Which export family a port is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Netflow,
    Ipfix,
    Sflow,
}

impl FlowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowKind::Netflow => "netflow",
            FlowKind::Ipfix => "ipfix",
            FlowKind::Sflow => "sflow",
        }
    }
}

pub struct FlowsUdpListener {
    host: String,
    ports: Vec<(u16, FlowKind)>,
    bound: AtomicBool,
}

impl FlowsUdpListener {
    pub fn new(
        host: String,
        netflow_ports: &[u16],
        ipfix_ports: &[u16],
        sflow_ports: &[u16],
    ) -> Self {
        let mut ports = Vec::new();
        ports.extend(netflow_ports.iter().map(|&p| (p, FlowKind::Netflow)));
        ports.extend(ipfix_ports.iter().map(|&p| (p, FlowKind::Ipfix)));
        ports.extend(sflow_ports.iter().map(|&p| (p, FlowKind::Sflow)));
        FlowsUdpListener {
            host,
            ports,
            bound: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Listener for FlowsUdpListener {
    fn name(&self) -> &str {
        "flows"
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        enqueue: EnqueueHandle,
    ) -> Result<(), SpoolError> {
        if self.ports.is_empty() {
            return Err(SpoolError::Unavailable(
                "flows listener has no ports configured".to_string(),
            ));
        }

        let mut sockets = Vec::new();
        for &(port, kind) in &self.ports {
            let bind = format!("{}:{port}", self.host);
            let socket = UdpSocket::bind(&bind)
                .await
                .map_err(|e| SpoolError::Unavailable(format!("bind {bind}: {e}")))?;
            info!(port, kind = kind.as_str(), "flow udp server started");
            sockets.push((socket, kind));
        }
        self.bound.store(true, Ordering::Release);

        let mut workers = JoinSet::new();
        for (socket, kind) in sockets {
            workers.spawn(flow_socket_loop(
                socket,
                kind,
                cancel.clone(),
                enqueue.clone(),
            ));
        }
        while workers.join_next().await.is_some() {}

        debug!("flows listener stopping");
        self.bound.store(false, Ordering::Release);
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }
}

async fn flow_socket_loop(
    socket: UdpSocket,
    kind: FlowKind,
    cancel: CancellationToken,
    enqueue: EnqueueHandle,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        let envelope = flow_envelope(&buf[..len], peer, kind);
                        enqueue.enqueue_or_drop(envelope).await;
                    }
                    Err(e) => {
                        debug!(kind = kind.as_str(), error = %e, "flow udp recv error");
                    }
                }
            }
        }
    }
}

fn flow_envelope(datagram: &[u8], peer: SocketAddr, kind: FlowKind) -> Envelope {
    Envelope::new(EventType::Flow, SOURCE)
        .with_label("host", peer.ip().to_string())
        .with_payload_field("subtype", json!(kind.as_str()))
        .with_payload_field("version", json!(detect_version(datagram)))
        .with_payload_field("source_ip", json!(peer.ip().to_string()))
        .with_payload_field("source_port", json!(peer.port()))
        .with_payload_field("size_bytes", json!(datagram.len()))
        .with_payload_field("payload_b64", json!(STANDARD.encode(datagram)))
}

/// Peeks the export version word: NetFlow v5/v9 and IPFIX carry it in the
/// first 16 bits, sFlow in the first 32.
fn detect_version(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < 2 {
        return None;
    }
    let v16 = u16::from_be_bytes([datagram[0], datagram[1]]);
    if matches!(v16, 5 | 9 | 10) {
        return Some(u32::from(v16));
    }
    if datagram.len() >= 4 {
        let v32 = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        if v32 == 5 {
            return Some(5);
        }
    }
    None
}
