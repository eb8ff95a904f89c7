use crate::domain::{DomainResult, Envelope, MessageType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One logically-new device message handed to durable storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreRecord {
    pub device_id: String,
    pub message_type: MessageType,
    pub envelope: Envelope,
    /// Payload exactly as the device sent it
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Durable storage collaborator (raw archive and time series)
///
/// Implementations own their retry policy; the engine only guarantees
/// that it attempted delivery.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DurableSink: Send + Sync {
    async fn store(&self, record: &StoreRecord) -> DomainResult<()>;

    /// Push out anything buffered inside the sink
    async fn flush(&self) -> DomainResult<()>;
}
