//! NMEA 0183 over UDP for vessel telemetry.
//!
//! Line-framed intake only: each datagram is split into lines, the sentence
//! tag is lifted from the frame, and the raw sentence ships unparsed. Field
//! decoding and checksum validation belong to a dedicated parser layer.
//! Talkers blast NMEA over UDP continuously, so spool backpressure means
//! drop-and-count.

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

const SOURCE: &str = "nmea_udp";
const MAX_DATAGRAM: usize = 4096;

pub struct NmeaUdpListener {
    bind: SocketAddr,
    bound: AtomicBool,
}

impl NmeaUdpListener {
    pub fn new(bind: SocketAddr) -> Self {
        NmeaUdpListener {
            bind,
            bound: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Listener for NmeaUdpListener {
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
        info!(bind = %self.bind, "nmea udp listener started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("nmea udp listener stopping");
                    self.bound.store(false, Ordering::Release);
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, peer)) => {
                            let text = String::from_utf8_lossy(&buf[..len]);
                            for line in text.lines() {
                                let line = line.trim();
                                if line.is_empty() {
                                    continue;
                                }
                                enqueue.enqueue_or_drop(sentence_envelope(line, peer)).await;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "nmea udp recv error");
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

fn sentence_envelope(line: &str, peer: SocketAddr) -> Envelope {
    let mut envelope = Envelope::new(EventType::Nmea, SOURCE)
        .with_label("host", peer.ip().to_string())
        .with_payload_field("raw", json!(line));
    if let Some(tag) = sentence_tag(line) {
        envelope = envelope.with_payload_field("sentence", json!(tag));
    }
    envelope
}

/// Lifts the five-character sentence tag from a `$TTSSS,...` frame without
/// touching the fields. Non-conforming lines ship raw with no tag.
fn sentence_tag(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('$')?;
    if rest.len() < 6 || !rest.is_char_boundary(5) {
        return None;
    }
    let (tag, remainder) = rest.split_at(5);
    if !remainder.starts_with(',') {
        return None;
    }
    if !tag.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return None;
    }
    Some(tag)
}
