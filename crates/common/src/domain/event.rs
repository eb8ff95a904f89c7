use crate::domain::{AckResult, DomainResult, OtaState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a device came to be considered offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// Explicit `offline` status message or broker last will
    Announced,
    /// No message within the device's liveness timeout
    Timeout,
}

/// Events raised by the engine for alerting, registry and API consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    SequenceGapDetected {
        device_id: String,
        missing_from: u32,
        missing_to: u32,
    },
    DeviceOnline {
        device_id: String,
        at: DateTime<Utc>,
    },
    DeviceOffline {
        device_id: String,
        at: DateTime<Utc>,
        reason: OfflineReason,
    },
    CommandAcked {
        command_id: String,
        device_id: String,
        result: AckResult,
        detail: Option<String>,
    },
    CommandTimedOut {
        command_id: String,
        device_id: String,
    },
    OtaStateChanged {
        device_id: String,
        command_id: String,
        state: OtaState,
        progress_percent: u8,
    },
    OtaProgressAnomaly {
        device_id: String,
        command_id: String,
        previous_percent: u8,
        reported_percent: u8,
    },
    DecodeFailed {
        topic: String,
        reason: String,
    },
}

impl DomainEvent {
    /// Stable name used for routing (e.g. as a subject token)
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::SequenceGapDetected { .. } => "sequence_gap_detected",
            DomainEvent::DeviceOnline { .. } => "device_online",
            DomainEvent::DeviceOffline { .. } => "device_offline",
            DomainEvent::CommandAcked { .. } => "command_acked",
            DomainEvent::CommandTimedOut { .. } => "command_timed_out",
            DomainEvent::OtaStateChanged { .. } => "ota_state_changed",
            DomainEvent::OtaProgressAnomaly { .. } => "ota_progress_anomaly",
            DomainEvent::DecodeFailed { .. } => "decode_failed",
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            DomainEvent::SequenceGapDetected { device_id, .. }
            | DomainEvent::DeviceOnline { device_id, .. }
            | DomainEvent::DeviceOffline { device_id, .. }
            | DomainEvent::CommandAcked { device_id, .. }
            | DomainEvent::CommandTimedOut { device_id, .. }
            | DomainEvent::OtaStateChanged { device_id, .. }
            | DomainEvent::OtaProgressAnomaly { device_id, .. } => Some(device_id),
            DomainEvent::DecodeFailed { .. } => None,
        }
    }
}

/// Delivers domain events to downstream consumers
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DomainEventPublisher: Send + Sync {
    async fn publish_event(&self, event: &DomainEvent) -> DomainResult<()>;
}
