use anyhow::Context;
use async_trait::async_trait;
use common::domain::{DomainError, DomainEvent, DomainEventPublisher, DomainResult};
use common::nats::JetStreamPublisher;
use std::sync::Arc;
use tracing::{debug, info};

/// Publishes domain events as JSON on `{stream}.{event_kind}`
pub struct NatsDomainEventPublisher {
    jetstream: Arc<dyn JetStreamPublisher>,
    base_subject: String,
}

impl NatsDomainEventPublisher {
    pub fn new(jetstream: Arc<dyn JetStreamPublisher>, base_subject: String) -> Self {
        info!(base_subject = %base_subject, "created domain event publisher");
        Self {
            jetstream,
            base_subject,
        }
    }
}

#[async_trait]
impl DomainEventPublisher for NatsDomainEventPublisher {
    async fn publish_event(&self, event: &DomainEvent) -> DomainResult<()> {
        let subject = format!("{}.{}", self.base_subject, event.kind());
        let payload = serde_json::to_vec(event)
            .context("failed to serialize domain event")
            .map_err(DomainError::RepositoryError)?;

        self.jetstream
            .publish(subject.clone(), payload.into())
            .await
            .context("failed to publish domain event")
            .map_err(DomainError::RepositoryError)?;

        debug!(subject = %subject, device_id = ?event.device_id(), "published domain event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::nats::MockJetStreamPublisher;

    #[tokio::test]
    async fn test_publish_gap_event() {
        let mut jetstream = MockJetStreamPublisher::new();
        jetstream
            .expect_publish()
            .withf(|subject: &String, payload: &Bytes| {
                let json: serde_json::Value = serde_json::from_slice(payload).unwrap();
                subject == "device_events.sequence_gap_detected"
                    && json["event"] == "sequence_gap_detected"
                    && json["missing_from"] == 2
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let publisher = NatsDomainEventPublisher::new(Arc::new(jetstream), "device_events".to_string());
        publisher
            .publish_event(&DomainEvent::SequenceGapDetected {
                device_id: "dc-meter-007".to_string(),
                missing_from: 2,
                missing_to: 2,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure() {
        let mut jetstream = MockJetStreamPublisher::new();
        jetstream
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("NATS publish failed")));

        let publisher = NatsDomainEventPublisher::new(Arc::new(jetstream), "device_events".to_string());
        let result = publisher
            .publish_event(&DomainEvent::CommandTimedOut {
                command_id: "cmd-1".to_string(),
                device_id: "dc-meter-007".to_string(),
            })
            .await;
        assert!(matches!(result, Err(DomainError::RepositoryError(_))));
    }
}
