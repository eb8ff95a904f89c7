use crate::domain::CommandStatus;
use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Why an acknowledgement could not be matched to a pending command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleAckReason {
    UnknownCommand,
    AlreadyTerminal(CommandStatus),
    DeviceMismatch { expected_device_id: String },
}

impl std::fmt::Display for StaleAckReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleAckReason::UnknownCommand => write!(f, "unknown command"),
            StaleAckReason::AlreadyTerminal(status) => {
                write!(f, "command already {}", status.as_str())
            }
            StaleAckReason::DeviceMismatch { expected_device_id } => {
                write!(f, "command belongs to device {}", expected_device_id)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Stale acknowledgement for command {command_id}: {reason}")]
    StaleAck {
        command_id: String,
        reason: StaleAckReason,
    },

    #[error("OTA already in progress for device {device_id} (command {active_command_id})")]
    OtaInProgress {
        device_id: String,
        active_command_id: String,
    },

    #[error("OTA report rejected for device {device_id}, command {command_id}: {reason}")]
    OtaTransitionRejected {
        device_id: String,
        command_id: String,
        reason: String,
    },

    #[error("Capacity exhausted for {table}: {capacity} entries in use")]
    CapacityExhausted { table: &'static str, capacity: usize },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Command id already used: {0}")]
    DuplicateCommandId(String),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to publish command {0}")]
    CommandPublishFailed(String),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

impl DomainError {
    /// Resource exhaustion is the only condition that must stop ingestion.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DomainError::CapacityExhausted { .. })
    }
}
