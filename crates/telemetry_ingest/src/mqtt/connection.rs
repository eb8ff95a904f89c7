use common::domain::{DomainError, DomainResult};
use rumqttc::MqttOptions;
use std::time::Duration;

/// Settings for one broker connection
#[derive(Debug, Clone)]
pub struct MqttConnectionConfig {
    pub broker_url: String,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Reconnect attempts before giving up; 0 retries forever
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
}

impl MqttConnectionConfig {
    pub fn mqtt_options(&self) -> DomainResult<MqttOptions> {
        let (host, port) = parse_broker_url(&self.broker_url)?;
        let mut options = MqttOptions::new(&self.client_id, host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        Ok(options)
    }

    pub(crate) fn retries_exhausted(&self, attempts: u32) -> bool {
        self.max_retry_attempts != 0 && attempts >= self.max_retry_attempts
    }
}

/// Parse broker URL in format mqtt://host:port or tcp://host:port or host:port
pub fn parse_broker_url(url: &str) -> DomainResult<(&str, u16)> {
    let url = url.trim();
    let url = url.trim_start_matches("mqtt://");
    let url = url.trim_start_matches("tcp://");

    let parts: Vec<&str> = url.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((*host, 1883)),
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DomainError::InvalidConfiguration(format!("Invalid port in broker URL: {}", port))
            })?;
            Ok((*host, port))
        }
        _ => Err(DomainError::InvalidConfiguration(format!(
            "Invalid broker URL format: {}",
            url
        ))),
    }
}
