//! HTTP(S) sink posting gzip JSON batches to the mothership.
//!
//! The reqwest client is built once and shared across attempts so the
//! connection pool survives retries. Response statuses are classified into
//! transient and permanent per the retry contract, and `Retry-After` hints
//! (seconds or HTTP-date) ride along on transient errors.

use super::{Sink, WriteReceipt};
use crate::envelope::BatchEnvelope;
use crate::error::SinkError;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Certificate, Identity, StatusCode};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Verify the server chain; disabling is for lab setups only.
    pub verify: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    pub url: String,
    pub auth_token: Option<String>,
    pub compression: bool,
    /// Per-attempt budget covering connect and read.
    pub timeout: Duration,
    pub tls: TlsSettings,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        HttpSinkConfig {
            url: String::new(),
            auth_token: None,
            compression: true,
            timeout: Duration::from_secs(30),
            tls: TlsSettings {
                verify: true,
                ..TlsSettings::default()
            },
        }
    }
}

pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    auth_token: Option<String>,
    compression: bool,
}

impl HttpSink {
    /// Builds the sink and its pooled client. TLS material that fails to
    /// load is a permanent error: retrying cannot fix a bad cert file.
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(120)))
            .user_agent(format!("edgebot/{}", env!("CARGO_PKG_VERSION")));

        if !config.tls.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(ca_path) = &config.tls.ca_bundle {
            let pem = std::fs::read(ca_path)
                .map_err(|e| SinkError::permanent(format!("read ca bundle {ca_path:?}: {e}")))?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| SinkError::permanent(format!("parse ca bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert_path), Some(key_path)) =
            (&config.tls.client_cert, &config.tls.client_key)
        {
            let mut pem = std::fs::read(cert_path).map_err(|e| {
                SinkError::permanent(format!("read client cert {cert_path:?}: {e}"))
            })?;
            let key = std::fs::read(key_path)
                .map_err(|e| SinkError::permanent(format!("read client key {key_path:?}: {e}")))?;
            pem.extend_from_slice(&key);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| SinkError::permanent(format!("parse client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| SinkError::permanent(format!("build http client: {e}")))?;

        Ok(HttpSink {
            client,
            url: config.url,
            auth_token: config.auth_token,
            compression: config.compression,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn write(&self, batch: &BatchEnvelope) -> Result<WriteReceipt, SinkError> {
        let json = serde_json::to_vec(batch)
            .map_err(|e| SinkError::permanent(format!("serialize batch: {e}")))?;

        let body = if self.compression {
            gzip(&json).map_err(|e| SinkError::permanent(format!("gzip batch: {e}")))?
        } else {
            json
        };
        let body_len = body.len();

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-Edgebot-Batch-Size", batch.batch_size.to_string())
            .body(body);
        if self.compression {
            request = request.header("Content-Encoding", "gzip");
        }
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        if batch.is_retry {
            request = request.header("X-Retry", "true");
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        if status.is_success() {
            debug!(
                status = status.as_u16(),
                events = batch.batch_size,
                bytes = body_len,
                "batch accepted"
            );
            return Ok(WriteReceipt {
                events: batch.batch_size,
                bytes: body_len,
            });
        }

        let retry_after = parse_retry_after(response.headers());
        Err(classify_status(status, retry_after))
    }
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn classify_request_error(err: reqwest::Error) -> SinkError {
    let text = err.to_string();
    // A failed chain when verification is on cannot heal by retrying.
    if text.contains("certificate") || text.contains("UnknownIssuer") {
        return SinkError::permanent(format!("tls verification failed: {text}"));
    }
    if err.is_builder() {
        // Malformed URL or request construction problem.
        return SinkError::permanent(text);
    }
    SinkError::transient(text)
}

/// Maps an HTTP status outside 2xx to a retry class.
fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> SinkError {
    match status.as_u16() {
        408 | 425 | 429 | 500 | 502 | 503 | 504 => SinkError::transient_with_hint(
            format!("http status {status}"),
            retry_after,
        ),
        400 | 401 | 403 | 404 | 409 | 413 | 415 | 422 => {
            SinkError::permanent(format!("http status {status}"))
        }
        // Anything else outside 2xx defaults to transient.
        _ => SinkError::transient_with_hint(format!("http status {status}"), retry_after),
    }
}

/// Parses `Retry-After` as delta-seconds or an HTTP-date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    retry_after_from_value(value)
}

fn retry_after_from_value(value: &HeaderValue) -> Option<Duration> {
    let text = value.to_str().ok()?.trim();
    if let Ok(seconds) = text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = chrono::DateTime::parse_from_rfc2822(text).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}
