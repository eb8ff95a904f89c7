use crate::domain::{AckResult, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server → device command kinds understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    UpdateConfig,
    StartOta,
    Reboot,
    FactoryReset,
    RequestStatus,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::UpdateConfig => "update_config",
            CommandKind::StartOta => "start_ota",
            CommandKind::Reboot => "reboot",
            CommandKind::FactoryReset => "factory_reset",
            CommandKind::RequestStatus => "request_status",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a dispatched command. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Accepted,
    Rejected,
    Error,
    Unsupported,
    TimedOut,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Accepted => "accepted",
            CommandStatus::Rejected => "rejected",
            CommandStatus::Error => "error",
            CommandStatus::Unsupported => "unsupported",
            CommandStatus::TimedOut => "timed_out",
        }
    }
}

impl From<AckResult> for CommandStatus {
    fn from(result: AckResult) -> Self {
        match result {
            AckResult::Accepted => CommandStatus::Accepted,
            AckResult::Rejected => CommandStatus::Rejected,
            AckResult::Error => CommandStatus::Error,
            AckResult::Unsupported => CommandStatus::Unsupported,
        }
    }
}

/// Request to send a command to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub device_id: String,
    #[serde(rename = "cmd")]
    pub kind: CommandKind,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Caller-supplied correlation token; generated when absent
    #[serde(default, rename = "cmd_id")]
    pub command_id: Option<String>,
}

/// A command that has been registered for correlation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCommand {
    pub command_id: String,
    pub device_id: String,
    pub kind: CommandKind,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub issued_at: DateTime<Utc>,
}

/// Outbound channel that delivers encoded commands to devices
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish an encoded command on the device's command topic
    async fn publish_command(&self, command: &DeviceCommand, payload: Vec<u8>) -> DomainResult<()>;
}
