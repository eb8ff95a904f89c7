use crate::domain::BoundedTable;
use crate::domain::telemetry_ingest_config::seconds;
use chrono::{DateTime, Utc};
use common::domain::{
    ConnectionStatus, DeviceRegistry, DeviceTimingConfig, DomainEvent, DomainResult,
    OfflineReason, ReportedStatus,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct LivenessState {
    last_seen: DateTime<Utc>,
    timeout: chrono::Duration,
    status: ConnectionStatus,
}

/// Tracks when each device was last heard from and turns silence into
/// offline transitions.
///
/// Timestamps passed in are server receipt times. Device clocks are not
/// trusted here: a broker last will carries the timestamp of the original
/// connect, and legacy payloads may have none at all.
pub struct LivenessMonitor {
    devices: BoundedTable<String, LivenessState>,
    registry: Arc<dyn DeviceRegistry>,
    fallback: DeviceTimingConfig,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        fallback: DeviceTimingConfig,
        capacity: usize,
        idle_ttl: chrono::Duration,
    ) -> Self {
        Self {
            devices: BoundedTable::new("liveness", capacity, idle_ttl)
                .with_eviction_guard(|state| state.status == ConnectionStatus::Offline),
            registry,
            fallback,
        }
    }

    /// Record that a message arrived. Duplicates count too.
    ///
    /// Returns `DeviceOnline` when the device was offline or not yet tracked.
    pub async fn touch(&self, device_id: &str, at: DateTime<Utc>) -> DomainResult<Option<DomainEvent>> {
        let key = device_id.to_string();
        let refreshed = self.devices.update(&key, at, |state| {
            if state.status != ConnectionStatus::Online {
                return false;
            }
            state.last_seen = state.last_seen.max(at);
            true
        });
        if refreshed == Some(true) {
            return Ok(None);
        }

        self.mark_online(device_id, at, false).await
    }

    /// Apply an explicit status announcement (retained status or last will),
    /// bypassing the timeout.
    pub async fn observe_status(
        &self,
        device_id: &str,
        status: ReportedStatus,
        at: DateTime<Utc>,
    ) -> DomainResult<Option<DomainEvent>> {
        match status {
            ReportedStatus::Online => self.mark_online(device_id, at, true).await,
            ReportedStatus::Offline => {
                let fallback_timeout = seconds(self.fallback.effective_timeout_secs());
                let went_offline = self.devices.upsert(
                    device_id.to_string(),
                    at,
                    || LivenessState {
                        last_seen: at,
                        timeout: fallback_timeout,
                        status: ConnectionStatus::Unknown,
                    },
                    |state| {
                        let changed = state.status != ConnectionStatus::Offline;
                        state.status = ConnectionStatus::Offline;
                        changed
                    },
                )?;

                if !went_offline {
                    return Ok(None);
                }
                info!(device_id = %device_id, "device announced offline");
                Ok(Some(DomainEvent::DeviceOffline {
                    device_id: device_id.to_string(),
                    at,
                    reason: OfflineReason::Announced,
                }))
            }
        }
    }

    /// Mark every device silent for longer than its timeout as offline.
    ///
    /// Each device is reported once per offline period.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<DomainEvent> {
        let events = self.devices.sweep(|device_id, state| {
            if state.status == ConnectionStatus::Offline || now - state.last_seen <= state.timeout {
                return None;
            }
            state.status = ConnectionStatus::Offline;
            Some(DomainEvent::DeviceOffline {
                device_id: device_id.clone(),
                at: now,
                reason: OfflineReason::Timeout,
            })
        });

        for event in &events {
            if let Some(device_id) = event.device_id() {
                warn!(device_id = %device_id, "device went silent, marking offline");
            }
        }
        events
    }

    pub fn status(&self, device_id: &str) -> ConnectionStatus {
        self.devices
            .read(&device_id.to_string(), |state| state.status)
            .unwrap_or(ConnectionStatus::Unknown)
    }

    pub fn last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.devices.read(&device_id.to_string(), |state| state.last_seen)
    }

    pub fn effective_timeout(&self, device_id: &str) -> Option<chrono::Duration> {
        self.devices.read(&device_id.to_string(), |state| state.timeout)
    }

    pub fn online_count(&self) -> usize {
        self.devices
            .count_where(|state| state.status == ConnectionStatus::Online)
    }

    /// Forget offline devices that stayed silent past the idle TTL
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        self.devices.evict_idle(now)
    }

    async fn mark_online(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        announced: bool,
    ) -> DomainResult<Option<DomainEvent>> {
        // Registry lookups happen only on (re)connect, never per message
        let timeout = seconds(self.resolve_timing(device_id).await.effective_timeout_secs());

        let came_online = self.devices.upsert(
            device_id.to_string(),
            at,
            || LivenessState {
                last_seen: at,
                timeout,
                status: ConnectionStatus::Unknown,
            },
            |state| {
                state.last_seen = if announced { at } else { state.last_seen.max(at) };
                state.timeout = timeout;
                let changed = state.status != ConnectionStatus::Online;
                state.status = ConnectionStatus::Online;
                changed
            },
        )?;

        if !came_online {
            return Ok(None);
        }
        info!(device_id = %device_id, announced, timeout_secs = timeout.num_seconds(), "device online");
        Ok(Some(DomainEvent::DeviceOnline {
            device_id: device_id.to_string(),
            at,
        }))
    }

    async fn resolve_timing(&self, device_id: &str) -> DeviceTimingConfig {
        match self.registry.get_device_timing_config(device_id).await {
            Ok(Some(timing)) => timing,
            Ok(None) => {
                debug!(device_id = %device_id, "device unknown to registry, using fallback timing");
                self.fallback
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "registry lookup failed, using fallback timing");
                self.fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::domain::{DomainError, MockDeviceRegistry};

    const DEVICE: &str = "dc-meter-007";

    fn monitor_with(registry: MockDeviceRegistry) -> LivenessMonitor {
        LivenessMonitor::new(
            Arc::new(registry),
            DeviceTimingConfig::new(60, 120),
            100,
            chrono::Duration::hours(1),
        )
    }

    fn registry_returning(timing: Option<DeviceTimingConfig>) -> MockDeviceRegistry {
        let mut registry = MockDeviceRegistry::new();
        registry
            .expect_get_device_timing_config()
            .returning(move |_| Ok(timing));
        registry
    }

    #[tokio::test]
    async fn test_first_message_brings_device_online() {
        let monitor = monitor_with(registry_returning(Some(DeviceTimingConfig::new(10, 30))));
        let now = Utc::now();

        let event = monitor.touch(DEVICE, now).await.unwrap();
        assert!(matches!(event, Some(DomainEvent::DeviceOnline { .. })));
        assert_eq!(monitor.status(DEVICE), ConnectionStatus::Online);
        assert_eq!(monitor.effective_timeout(DEVICE), Some(chrono::Duration::seconds(60)));

        assert_eq!(monitor.touch(DEVICE, now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_timeout_boundaries() {
        let monitor = monitor_with(registry_returning(Some(DeviceTimingConfig::new(10, 30))));
        let start = Utc::now();
        monitor.touch(DEVICE, start).await.unwrap();

        assert!(monitor.sweep(start + chrono::Duration::seconds(59)).is_empty());
        assert!(monitor.sweep(start + chrono::Duration::seconds(60)).is_empty());

        let events = monitor.sweep(start + chrono::Duration::seconds(61));
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DomainEvent::DeviceOffline { reason: OfflineReason::Timeout, .. }
        ));
        assert!(monitor.sweep(start + chrono::Duration::seconds(90)).is_empty());
    }

    #[tokio::test]
    async fn test_message_after_offline_brings_device_back() {
        let monitor = monitor_with(registry_returning(None));
        let start = Utc::now();
        monitor.touch(DEVICE, start).await.unwrap();
        monitor.sweep(start + chrono::Duration::seconds(241));
        assert_eq!(monitor.status(DEVICE), ConnectionStatus::Offline);

        let event = monitor
            .touch(DEVICE, start + chrono::Duration::seconds(300))
            .await
            .unwrap();
        assert!(matches!(event, Some(DomainEvent::DeviceOnline { .. })));
    }

    #[tokio::test]
    async fn test_announced_offline_is_immediate() {
        let monitor = monitor_with(registry_returning(Some(DeviceTimingConfig::new(10, 30))));
        let now = Utc::now();
        monitor.touch(DEVICE, now).await.unwrap();

        let event = monitor
            .observe_status(DEVICE, ReportedStatus::Offline, now)
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(DomainEvent::DeviceOffline { reason: OfflineReason::Announced, .. })
        ));
        assert_eq!(monitor.status(DEVICE), ConnectionStatus::Offline);

        // a repeated last will is not a second transition
        let again = monitor
            .observe_status(DEVICE, ReportedStatus::Offline, now)
            .await
            .unwrap();
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn test_announced_online_resets_last_seen() {
        let monitor = monitor_with(registry_returning(Some(DeviceTimingConfig::new(10, 30))));
        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(30);
        monitor.touch(DEVICE, later).await.unwrap();

        monitor
            .observe_status(DEVICE, ReportedStatus::Online, earlier)
            .await
            .unwrap();
        assert_eq!(monitor.last_seen(DEVICE), Some(earlier));
    }

    #[tokio::test]
    async fn test_registry_failure_uses_fallback() {
        let mut registry = MockDeviceRegistry::new();
        registry
            .expect_get_device_timing_config()
            .returning(|_| Err(DomainError::RepositoryError(anyhow::anyhow!("registry down"))));
        let monitor = monitor_with(registry);

        monitor.touch(DEVICE, Utc::now()).await.unwrap();
        assert_eq!(monitor.effective_timeout(DEVICE), Some(chrono::Duration::seconds(240)));
    }

    #[tokio::test]
    async fn test_only_offline_devices_are_evicted() {
        let monitor = monitor_with(registry_returning(None));
        let start = Utc::now();
        monitor.touch("quiet", start).await.unwrap();
        monitor.touch("chatty", start).await.unwrap();
        monitor
            .observe_status("quiet", ReportedStatus::Offline, start)
            .await
            .unwrap();

        let evicted = monitor.evict_idle(start + chrono::Duration::hours(2));
        assert_eq!(evicted, 1);
        assert_eq!(monitor.status("quiet"), ConnectionStatus::Unknown);
        assert_eq!(monitor.status("chatty"), ConnectionStatus::Online);
    }
}
