use anyhow::Result;
use async_trait::async_trait;

/// Publish side of JetStream, narrowed to what the ingest sinks need
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait JetStreamPublisher: Send + Sync {
    /// Publish a message and wait for the stream to acknowledge it
    async fn publish(&self, subject: String, payload: bytes::Bytes) -> Result<()>;
}
