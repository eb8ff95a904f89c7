use async_trait::async_trait;
use common::domain::{DeviceRegistry, DeviceTimingConfig, DomainError, DomainResult};
use std::collections::HashMap;

/// Device registry backed by configured per-device timing overrides.
///
/// Devices without an override are unknown, and the liveness monitor falls
/// back to its conservative default timing for them.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceRegistry {
    timings: HashMap<String, DeviceTimingConfig>,
}

impl StaticDeviceRegistry {
    pub fn new(timings: HashMap<String, DeviceTimingConfig>) -> Self {
        Self { timings }
    }

    /// Parse a comma separated `device_id=send_secs:hello_secs` list
    ///
    /// ```
    /// use telemetry_ingest::domain::StaticDeviceRegistry;
    ///
    /// let registry = StaticDeviceRegistry::from_overrides("dc-meter-007=10:30, dc-meter-008=5:60").unwrap();
    /// assert_eq!(registry.len(), 2);
    /// ```
    pub fn from_overrides(overrides: &str) -> DomainResult<Self> {
        let mut timings = HashMap::new();

        for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = |detail: &str| {
                DomainError::InvalidConfiguration(format!(
                    "device timing override '{}': {}",
                    entry, detail
                ))
            };

            let (device_id, intervals) = entry
                .split_once('=')
                .ok_or_else(|| invalid("expected device_id=send:hello"))?;
            let device_id = device_id.trim();
            if device_id.is_empty() {
                return Err(invalid("device id cannot be empty"));
            }

            let (send, hello) = intervals
                .split_once(':')
                .ok_or_else(|| invalid("expected send:hello intervals"))?;
            let send: u64 = send
                .trim()
                .parse()
                .map_err(|_| invalid("send interval is not a number of seconds"))?;
            let hello: u64 = hello
                .trim()
                .parse()
                .map_err(|_| invalid("hello interval is not a number of seconds"))?;
            if send == 0 || hello == 0 {
                return Err(invalid("intervals must be positive"));
            }

            timings.insert(device_id.to_string(), DeviceTimingConfig::new(send, hello));
        }

        Ok(Self { timings })
    }

    pub fn len(&self) -> usize {
        self.timings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timings.is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn get_device_timing_config(&self, device_id: &str) -> DomainResult<Option<DeviceTimingConfig>> {
        Ok(self.timings.get(device_id).copied())
    }
}
