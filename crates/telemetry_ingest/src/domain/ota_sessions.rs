use crate::domain::BoundedTable;
use chrono::{DateTime, Utc};
use common::domain::{DomainError, DomainEvent, DomainResult, OtaState, OtaStatusReport};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

const HISTORY_PER_DEVICE: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OtaSession {
    pub device_id: String,
    pub command_id: String,
    pub target_firmware_version: String,
    pub state: OtaState,
    pub progress_percent: u8,
    pub started_at: DateTime<Utc>,
    pub last_state_change: DateTime<Utc>,
    pub last_report_at: DateTime<Utc>,
    /// Set once the device has sent any `ota_status` for this session
    pub reported: bool,
    pub failure_reason: Option<String>,
}

impl OtaSession {
    fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> DomainEvent {
        self.state = OtaState::Failed;
        self.last_state_change = now;
        self.failure_reason = Some(reason.to_string());
        DomainEvent::OtaStateChanged {
            device_id: self.device_id.clone(),
            command_id: self.command_id.clone(),
            state: OtaState::Failed,
            progress_percent: self.progress_percent,
        }
    }
}

#[derive(Default)]
struct DeviceOta {
    active: Option<OtaSession>,
    history: VecDeque<OtaSession>,
}

impl DeviceOta {
    fn retire_active(&mut self) {
        if let Some(session) = self.active.take() {
            if self.history.len() == HISTORY_PER_DEVICE {
                self.history.pop_front();
            }
            self.history.push_back(session);
        }
    }

    fn find(&self, command_id: &str) -> Option<&OtaSession> {
        self.active
            .iter()
            .chain(self.history.iter())
            .find(|session| session.command_id == command_id)
    }
}

/// Firmware upgrade sessions, at most one active per device
pub struct OtaSessionTracker {
    devices: BoundedTable<String, DeviceOta>,
    stall_timeout: chrono::Duration,
}

impl OtaSessionTracker {
    pub fn new(capacity: usize, idle_ttl: chrono::Duration, stall_timeout: chrono::Duration) -> Self {
        Self {
            devices: BoundedTable::new("ota", capacity, idle_ttl)
                .with_eviction_guard(|device| device.active.is_none()),
            stall_timeout,
        }
    }

    /// Open a session for a `start_ota` command.
    ///
    /// Fails with `OtaInProgress` while another session for the device is active.
    pub fn begin_session(
        &self,
        device_id: &str,
        command_id: &str,
        target_firmware_version: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.devices.upsert(device_id.to_string(), now, DeviceOta::default, |device| {
            if let Some(active) = &device.active {
                return Err(DomainError::OtaInProgress {
                    device_id: device_id.to_string(),
                    active_command_id: active.command_id.clone(),
                });
            }
            device.active = Some(OtaSession {
                device_id: device_id.to_string(),
                command_id: command_id.to_string(),
                target_firmware_version: target_firmware_version.to_string(),
                state: OtaState::Issued,
                progress_percent: 0,
                started_at: now,
                last_state_change: now,
                last_report_at: now,
                reported: false,
                failure_reason: None,
            });
            Ok(())
        })??;

        info!(device_id = %device_id, command_id = %command_id, target = %target_firmware_version, "OTA session opened");
        Ok(())
    }

    /// Apply an `ota_status` report from the device.
    ///
    /// Reports for unknown or finished sessions and state regressions are
    /// rejected. A falling progress percentage is accepted but raises an
    /// anomaly event.
    pub fn apply_report(
        &self,
        device_id: &str,
        report: &OtaStatusReport,
        now: DateTime<Utc>,
    ) -> DomainResult<Vec<DomainEvent>> {
        let rejected = |reason: String| DomainError::OtaTransitionRejected {
            device_id: device_id.to_string(),
            command_id: report.command_id.clone(),
            reason,
        };

        let outcome = self.devices.update(&device_id.to_string(), now, |device| {
            let Some(session) = device
                .active
                .as_mut()
                .filter(|session| session.command_id == report.command_id)
            else {
                return Err(match device.find(&report.command_id) {
                    Some(finished) => rejected(format!("session already {}", finished.state)),
                    None => rejected("no such session".to_string()),
                });
            };

            if report.state.rank() < session.state.rank() {
                return Err(rejected(format!(
                    "state cannot go from {} back to {}",
                    session.state, report.state
                )));
            }

            let mut events = Vec::with_capacity(2);
            if report.progress_percent < session.progress_percent {
                events.push(DomainEvent::OtaProgressAnomaly {
                    device_id: device_id.to_string(),
                    command_id: session.command_id.clone(),
                    previous_percent: session.progress_percent,
                    reported_percent: report.progress_percent,
                });
            }
            if let Some(target) = &report.target_firmware_version {
                if *target != session.target_firmware_version {
                    warn!(
                        device_id = %device_id,
                        command_id = %session.command_id,
                        expected = %session.target_firmware_version,
                        reported = %target,
                        "device reports a different OTA target"
                    );
                }
            }

            if report.state != session.state {
                session.last_state_change = now;
            }
            session.state = report.state;
            session.progress_percent = report.progress_percent;
            session.last_report_at = now;
            session.reported = true;
            events.push(DomainEvent::OtaStateChanged {
                device_id: device_id.to_string(),
                command_id: session.command_id.clone(),
                state: session.state,
                progress_percent: session.progress_percent,
            });

            if session.state.is_terminal() {
                device.retire_active();
            }
            Ok(events)
        });

        let events = outcome.unwrap_or_else(|| Err(rejected("no OTA history for device".to_string())))?;
        if events
            .iter()
            .any(|event| matches!(event, DomainEvent::OtaProgressAnomaly { .. }))
        {
            warn!(device_id = %device_id, command_id = %report.command_id, "OTA progress went backwards");
        }
        Ok(events)
    }

    /// Fail the active session if it belongs to `command_id`
    pub fn abort(
        &self,
        device_id: &str,
        command_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<DomainEvent> {
        self.fail_active(device_id, command_id, reason, now, |_| true)
    }

    /// Fail the session only while the device has shown no sign of starting it.
    ///
    /// A session that is past `Issued` or has any progress report survives;
    /// the stall sweep covers it from then on.
    pub fn abort_unstarted(
        &self,
        device_id: &str,
        command_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<DomainEvent> {
        self.fail_active(device_id, command_id, reason, now, |session| {
            session.state == OtaState::Issued && !session.reported
        })
    }

    /// Drop a session whose command was never registered.
    ///
    /// Nothing was announced for it, so no event is produced and it is not
    /// kept as history.
    pub fn discard(&self, device_id: &str, command_id: &str, now: DateTime<Utc>) -> bool {
        let discarded = self
            .devices
            .update(&device_id.to_string(), now, |device| {
                if device
                    .active
                    .as_ref()
                    .is_some_and(|session| session.command_id == command_id)
                {
                    device.active = None;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if discarded {
            debug!(device_id = %device_id, command_id = %command_id, "OTA session discarded");
        }
        discarded
    }

    fn fail_active(
        &self,
        device_id: &str,
        command_id: &str,
        reason: &str,
        now: DateTime<Utc>,
        may_fail: impl FnOnce(&OtaSession) -> bool,
    ) -> Option<DomainEvent> {
        let event = self
            .devices
            .update(&device_id.to_string(), now, |device| {
                let session = device
                    .active
                    .as_mut()
                    .filter(|session| session.command_id == command_id && may_fail(&**session))?;
                let event = session.fail(reason, now);
                device.retire_active();
                Some(event)
            })
            .flatten()?;

        warn!(device_id = %device_id, command_id = %command_id, reason = %reason, "OTA session aborted");
        Some(event)
    }

    /// Fail active sessions that have not reported for longer than the stall timeout
    pub fn sweep_stalled(&self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        let stall_timeout = self.stall_timeout;
        self.devices.sweep(|device_id, device| {
            let session = device.active.as_mut()?;
            if now - session.last_report_at <= stall_timeout {
                return None;
            }
            warn!(
                device_id = %device_id,
                command_id = %session.command_id,
                state = %session.state,
                "OTA session stalled"
            );
            let event = session.fail("no progress reported before stall timeout", now);
            device.retire_active();
            Some(event)
        })
    }

    pub fn active_session(&self, device_id: &str) -> Option<OtaSession> {
        self.devices
            .read(&device_id.to_string(), |device| device.active.clone())
            .flatten()
    }

    pub fn session(&self, device_id: &str, command_id: &str) -> Option<OtaSession> {
        self.devices
            .read(&device_id.to_string(), |device| device.find(command_id).cloned())
            .flatten()
    }

    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        self.devices.evict_idle(now)
    }
}
