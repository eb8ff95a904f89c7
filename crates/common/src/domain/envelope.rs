use crate::domain::OtaState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on measurements carried by one telemetry datagram
pub const MAX_MEASUREMENTS_PER_BATCH: usize = 200;

/// Protocol revision declared by the `v` field of a device payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Legacy flat payloads without sequence numbers
    V1,
    /// Versioned envelope with per-device sequence numbers
    V2,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }
}

/// Inbound message category, one per device topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Telemetry,
    Hello,
    Status,
    CommandAck,
    OtaStatus,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Telemetry => "telemetry",
            MessageType::Hello => "hello",
            MessageType::Status => "status",
            MessageType::CommandAck => "command_ack",
            MessageType::OtaStatus => "ota_status",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded device message: the common header plus a typed body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub version: ProtocolVersion,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: Option<u32>,
    pub message_type: MessageType,
    pub body: MessageBody,
}

impl Envelope {
    /// Sequence number usable for deduplication, if any.
    ///
    /// Legacy payloads never carry one, and neither do status announcements
    /// (they are retained and replayed by the broker).
    pub fn dedup_sequence(&self) -> Option<u32> {
        match self.version {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => self.sequence,
        }
    }

    /// Sequence in the signed form used by storage (`-1` when absent)
    pub fn sequence_or_legacy(&self) -> i64 {
        self.dedup_sequence().map(i64::from).unwrap_or(-1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Telemetry(TelemetryBatch),
    LegacyTelemetry(LegacyTelemetry),
    Hello(HelloReport),
    Status(StatusReport),
    CommandAck(CommandAckReport),
    OtaStatus(OtaStatusReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub measurement_type: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryBatch {
    pub measurements: Vec<Measurement>,
}

/// Numeric field of a version 1 flat payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyReading {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyTelemetry {
    pub readings: Vec<LegacyReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HelloReport {
    pub fw_version: String,
    pub uptime_s: u64,
    pub broker_connections: Option<u32>,
    pub buf_usage_pct: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub status: ReportedStatus,
}

/// Result a device reports for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckResult {
    Accepted,
    Rejected,
    Error,
    Unsupported,
}

impl AckResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckResult::Accepted => "accepted",
            AckResult::Rejected => "rejected",
            AckResult::Error => "error",
            AckResult::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandAckReport {
    pub command_id: String,
    pub result: AckResult,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaStatusReport {
    pub command_id: String,
    pub state: OtaState,
    pub progress_percent: u8,
    pub target_firmware_version: Option<String>,
}
