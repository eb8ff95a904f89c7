use crate::nats::subject_token;
use anyhow::Context;
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, DurableSink, StoreRecord};
use common::nats::JetStreamPublisher;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Durable sink writing accepted envelopes to a JetStream stream as JSON.
///
/// Subjects are `{stream}.{device_id}.{message_type}`. Each record is
/// retried with exponential backoff before it is reported as failed.
pub struct NatsEnvelopeSink {
    jetstream: Arc<dyn JetStreamPublisher>,
    base_subject: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl NatsEnvelopeSink {
    pub fn new(jetstream: Arc<dyn JetStreamPublisher>, base_subject: String) -> Self {
        info!(base_subject = %base_subject, "created envelope sink");
        Self {
            jetstream,
            base_subject,
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    fn subject(&self, record: &StoreRecord) -> String {
        format!(
            "{}.{}.{}",
            self.base_subject,
            subject_token(&record.device_id),
            record.message_type
        )
    }
}

#[async_trait]
impl DurableSink for NatsEnvelopeSink {
    #[instrument(skip(self, record), fields(device_id = %record.device_id, message_type = %record.message_type))]
    async fn store(&self, record: &StoreRecord) -> DomainResult<()> {
        let subject = self.subject(record);
        let payload: bytes::Bytes = serde_json::to_vec(record)
            .context("failed to serialize store record")
            .map_err(DomainError::RepositoryError)?
            .into();

        let mut delay = self.retry_delay;
        let mut attempt = 1;
        loop {
            match self.jetstream.publish(subject.clone(), payload.clone()).await {
                Ok(()) => {
                    debug!(subject = %subject, size_bytes = payload.len(), attempt, "stored envelope");
                    return Ok(());
                }
                Err(e) if attempt < self.max_attempts => {
                    warn!(subject = %subject, attempt, error = %e, "envelope publish failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DomainError::RepositoryError(e.context(format!(
                        "failed to store envelope on {} after {} attempts",
                        subject, attempt
                    ))));
                }
            }
        }
    }

    /// Every store already waits for its JetStream ack
    async fn flush(&self) -> DomainResult<()> {
        Ok(())
    }
}
