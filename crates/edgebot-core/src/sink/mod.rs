//! Batch consumers: anything that can accept an outbound batch envelope.

mod file;
mod http;

pub use file::FileSink;
pub use http::{HttpSink, HttpSinkConfig, TlsSettings};

use crate::envelope::BatchEnvelope;
use crate::error::SinkError;
use async_trait::async_trait;

/// What a successful write delivered.
#[derive(Debug, Clone, Copy)]
pub struct WriteReceipt {
    pub events: usize,
    /// Payload bytes as transmitted (post-compression for HTTP).
    pub bytes: usize,
}

/// The batch-write contract every sink implements.
///
/// A write is one attempt; classification of the failure drives the retry
/// policy. Writes are all-or-nothing: partial acknowledgement is not modeled.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short tag used in metric labels and logs (`http`, `file`).
    fn name(&self) -> &str;

    async fn write(&self, batch: &BatchEnvelope) -> Result<WriteReceipt, SinkError>;
}
