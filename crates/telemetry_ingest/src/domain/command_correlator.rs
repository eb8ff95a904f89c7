use crate::domain::{BoundedTable, OtaSessionTracker};
use chrono::{DateTime, Utc};
use common::domain::{
    AckResult, CommandAckReport, CommandKind, CommandRequest, CommandStatus, DeviceCommand,
    DomainError, DomainEvent, DomainResult, StaleAckReason,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Everything known about a dispatched command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    pub command: DeviceCommand,
    pub status: CommandStatus,
    pub detail: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Set when the device answered after the command had already timed out
    pub acked_after_timeout: bool,
}

impl CommandRecord {
    fn settle(&mut self, status: CommandStatus, detail: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.detail = detail;
        self.settled_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack settled a pending command
    Settled(CommandStatus),
    /// The command had timed out; only its historical status was updated
    LateAfterTimeout(CommandStatus),
}

/// Correlates device acknowledgements with the commands that caused them
pub struct CommandCorrelator {
    commands: BoundedTable<String, CommandRecord>,
    ota: Arc<OtaSessionTracker>,
    dispatch_timeout: chrono::Duration,
    retention: chrono::Duration,
}

impl CommandCorrelator {
    pub fn new(
        ota: Arc<OtaSessionTracker>,
        dispatch_timeout: chrono::Duration,
        retention: chrono::Duration,
        capacity: usize,
    ) -> Self {
        Self {
            commands: BoundedTable::new("commands", capacity, retention)
                .with_eviction_guard(|record| record.status.is_terminal()),
            ota,
            dispatch_timeout,
            retention,
        }
    }

    /// Register a command and return it ready for publishing.
    ///
    /// `start_ota` opens the device's OTA session first, so a concurrent
    /// upgrade is refused before anything is recorded.
    #[instrument(skip(self, request), fields(device_id = %request.device_id, command = %request.kind))]
    pub fn dispatch(&self, request: CommandRequest, now: DateTime<Utc>) -> DomainResult<DeviceCommand> {
        if request.device_id.trim().is_empty() {
            return Err(DomainError::InvalidCommand("device_id is required".to_string()));
        }
        let target_firmware = match request.kind {
            CommandKind::StartOta => Some(required_firmware_version(&request)?),
            _ => None,
        };

        let command_id = match request.command_id {
            Some(id) if id.trim().is_empty() => {
                return Err(DomainError::InvalidCommand("cmd_id must not be empty".to_string()))
            }
            Some(id) => id,
            None => xid::new().to_string(),
        };
        if self.commands.contains(&command_id) {
            return Err(DomainError::DuplicateCommandId(command_id));
        }

        let command = DeviceCommand {
            command_id: command_id.clone(),
            device_id: request.device_id,
            kind: request.kind,
            params: request.params,
            issued_at: now,
        };

        if let Some(target) = &target_firmware {
            self.ota
                .begin_session(&command.device_id, &command_id, target, now)?;
        }

        let record = CommandRecord {
            command: command.clone(),
            status: CommandStatus::Pending,
            detail: None,
            settled_at: None,
            acked_after_timeout: false,
        };
        let inserted = self.commands.insert_new(command_id.clone(), now, record);
        if !matches!(inserted, Ok(true)) {
            if target_firmware.is_some() {
                self.ota.discard(&command.device_id, &command_id, now);
            }
            inserted?;
            return Err(DomainError::DuplicateCommandId(command_id));
        }

        info!(command_id = %command_id, "command dispatched");
        Ok(command)
    }

    /// Match an acknowledgement from `device_id` to its command.
    ///
    /// Acks for unknown commands, commands of another device and commands
    /// already settled are `StaleAck` errors. An ack for a timed-out command
    /// is recorded once as history and never makes it pending again.
    pub fn on_ack(
        &self,
        device_id: &str,
        ack: &CommandAckReport,
        now: DateTime<Utc>,
    ) -> DomainResult<(AckOutcome, Option<DomainEvent>)> {
        let stale = |reason: StaleAckReason| DomainError::StaleAck {
            command_id: ack.command_id.clone(),
            reason,
        };

        let (outcome, kind) = self
            .commands
            .update(&ack.command_id, now, |record| {
                if record.command.device_id != device_id {
                    return Err(stale(StaleAckReason::DeviceMismatch {
                        expected_device_id: record.command.device_id.clone(),
                    }));
                }
                let status = CommandStatus::from(ack.result);
                let outcome = match record.status {
                    CommandStatus::Pending => AckOutcome::Settled(status),
                    CommandStatus::TimedOut if !record.acked_after_timeout => {
                        record.acked_after_timeout = true;
                        AckOutcome::LateAfterTimeout(status)
                    }
                    settled => return Err(stale(StaleAckReason::AlreadyTerminal(settled))),
                };
                record.settle(status, ack.detail.clone(), now);
                Ok((outcome, record.command.kind))
            })
            .unwrap_or_else(|| Err(stale(StaleAckReason::UnknownCommand)))?;

        let ota_event = match outcome {
            AckOutcome::Settled(_) if kind == CommandKind::StartOta && ack.result != AckResult::Accepted => {
                let reason = format!("device answered start_ota with {}", ack.result.as_str());
                self.ota.abort(device_id, &ack.command_id, &reason, now)
            }
            _ => None,
        };

        debug!(command_id = %ack.command_id, result = ack.result.as_str(), ?outcome, "ack correlated");
        Ok((outcome, ota_event))
    }

    /// Record that publishing failed; the command will never be acked
    pub fn mark_publish_failed(&self, command_id: &str, detail: String, now: DateTime<Utc>) -> Option<DomainEvent> {
        let command = self
            .commands
            .update(&command_id.to_string(), now, |record| {
                record.settle(CommandStatus::Error, Some(detail), now);
                record.command.clone()
            })?;

        if command.kind != CommandKind::StartOta {
            return None;
        }
        self.ota
            .abort(&command.device_id, command_id, "command could not be published", now)
    }

    /// Time out overdue commands and forget settled ones past retention.
    ///
    /// Returns `CommandTimedOut` events plus `OtaStateChanged` for upgrades
    /// whose `start_ota` went unanswered. An upgrade the device has already
    /// reported progress on only lost its ack and stays active.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        let dispatch_timeout = self.dispatch_timeout;
        let timed_out = self.commands.sweep(|_, record| {
            if record.status != CommandStatus::Pending || now - record.command.issued_at <= dispatch_timeout {
                return None;
            }
            record.settle(CommandStatus::TimedOut, None, now);
            Some(record.command.clone())
        });

        let mut events = Vec::with_capacity(timed_out.len());
        for command in timed_out {
            warn!(command_id = %command.command_id, device_id = %command.device_id, "command timed out");
            events.push(DomainEvent::CommandTimedOut {
                command_id: command.command_id.clone(),
                device_id: command.device_id.clone(),
            });
            if command.kind == CommandKind::StartOta {
                events.extend(self.ota.abort_unstarted(
                    &command.device_id,
                    &command.command_id,
                    "start_ota was never acknowledged",
                    now,
                ));
            }
        }

        let retention = self.retention;
        let forgotten = self.commands.evict_where(|record| {
            record
                .settled_at
                .is_some_and(|settled_at| now - settled_at > retention)
        });
        if forgotten > 0 {
            debug!(forgotten, "dropped settled commands past retention");
        }
        events
    }

    pub fn status(&self, command_id: &str) -> Option<CommandStatus> {
        self.commands.read(&command_id.to_string(), |record| record.status)
    }

    pub fn record(&self, command_id: &str) -> Option<CommandRecord> {
        self.commands.read(&command_id.to_string(), |record| record.clone())
    }

    /// Commands still waiting for an acknowledgement
    pub fn pending_count(&self) -> usize {
        self.commands
            .count_where(|record| record.status == CommandStatus::Pending)
    }
}

fn required_firmware_version(request: &CommandRequest) -> DomainResult<String> {
    request
        .params
        .get("fw_version")
        .and_then(|value| value.as_str())
        .filter(|version| !version.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| DomainError::InvalidCommand("start_ota requires params.fw_version".to_string()))
}
