use crate::domain::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Publish cadence configured for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTimingConfig {
    pub send_interval_secs: u64,
    pub hello_interval_secs: u64,
}

impl DeviceTimingConfig {
    pub fn new(send_interval_secs: u64, hello_interval_secs: u64) -> Self {
        Self {
            send_interval_secs,
            hello_interval_secs,
        }
    }

    /// Silence tolerated before a device is declared offline:
    /// two of whichever interval is longer.
    pub fn effective_timeout_secs(&self) -> u64 {
        2 * self.send_interval_secs.max(self.hello_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Online,
    Offline,
}

/// Read access to the device registry
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Timing configuration for a device, `None` if the registry does not know it
    async fn get_device_timing_config(
        &self,
        device_id: &str,
    ) -> DomainResult<Option<DeviceTimingConfig>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout_doubles_longest_interval() {
        assert_eq!(DeviceTimingConfig::new(10, 30).effective_timeout_secs(), 60);
        assert_eq!(DeviceTimingConfig::new(45, 30).effective_timeout_secs(), 90);
    }
}
