use common::domain::DeviceTimingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryIngestConfig {
    /// First topic level of every device topic (default: `iot`)
    pub topic_root: String,

    /// Out-of-order sequences remembered per device (default: 256)
    pub dedup_window_size: usize,

    /// Maximum entries per state table (default: 50_000)
    pub table_capacity: usize,

    /// Idle time before per-device state may be evicted (default: 24 hours)
    pub device_idle_ttl_secs: u64,

    /// Used when the registry has no timing for a device (default: 60 seconds)
    pub fallback_send_interval_secs: u64,

    /// Used when the registry has no timing for a device (default: 120 seconds)
    pub fallback_hello_interval_secs: u64,

    /// Liveness sweep period (default: 10 seconds)
    pub liveness_sweep_interval_secs: u64,

    /// Command and OTA sweep period (default: 5 seconds)
    pub command_sweep_interval_secs: u64,

    /// Age after which an unacknowledged command times out (default: 30 seconds)
    pub command_timeout_secs: u64,

    /// How long settled commands stay queryable (default: 1 hour)
    pub command_retention_secs: u64,

    /// OTA session without a progress report for this long is failed (default: 15 minutes)
    pub ota_stall_timeout_secs: u64,

    /// Buffered sink writes and events per outbox (default: 4096)
    pub outbox_capacity: usize,
}

impl Default for TelemetryIngestConfig {
    fn default() -> Self {
        Self {
            topic_root: "iot".to_string(),
            dedup_window_size: 256,
            table_capacity: 50_000,
            device_idle_ttl_secs: 24 * 60 * 60,
            fallback_send_interval_secs: 60,
            fallback_hello_interval_secs: 120,
            liveness_sweep_interval_secs: 10,
            command_sweep_interval_secs: 5,
            command_timeout_secs: 30,
            command_retention_secs: 60 * 60,
            ota_stall_timeout_secs: 15 * 60,
            outbox_capacity: 4096,
        }
    }
}

impl TelemetryIngestConfig {
    pub fn fallback_timing(&self) -> DeviceTimingConfig {
        DeviceTimingConfig::new(
            self.fallback_send_interval_secs,
            self.fallback_hello_interval_secs,
        )
    }

    pub fn device_idle_ttl(&self) -> chrono::Duration {
        seconds(self.device_idle_ttl_secs)
    }

    pub fn command_timeout(&self) -> chrono::Duration {
        seconds(self.command_timeout_secs)
    }

    pub fn command_retention(&self) -> chrono::Duration {
        seconds(self.command_retention_secs)
    }

    pub fn ota_stall_timeout(&self) -> chrono::Duration {
        seconds(self.ota_stall_timeout_secs)
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_interval_secs.max(1))
    }

    pub fn command_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.command_sweep_interval_secs.max(1))
    }
}

pub(crate) fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(u64::from(u32::MAX)) as i64)
}
