use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use telemetry_ingest::domain::TelemetryIngestConfig;
use telemetry_ingest::mqtt::MqttConnectionConfig;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // OpenTelemetry
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// OTLP gRPC endpoint
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    // NATS configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream stream receiving stored envelopes
    #[serde(default = "default_nats_envelope_stream")]
    pub nats_envelope_stream: String,

    /// JetStream stream receiving domain events
    #[serde(default = "default_nats_event_stream")]
    pub nats_event_stream: String,

    /// Request/reply subject for device commands
    #[serde(default = "default_nats_command_subject")]
    pub nats_command_subject: String,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // MQTT configuration
    /// Comma separated broker URLs; one subscription per broker
    #[serde(default = "default_mqtt_broker_urls")]
    pub mqtt_broker_urls: String,

    /// Client ids are `{prefix}-{index}`, the command publisher uses `{prefix}-cmd`
    #[serde(default = "default_mqtt_client_id_prefix")]
    pub mqtt_client_id_prefix: String,

    #[serde(default = "default_mqtt_topic_root")]
    pub mqtt_topic_root: String,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    /// Reconnect attempts per broker; 0 retries forever
    #[serde(default = "default_mqtt_max_retry_attempts")]
    pub mqtt_max_retry_attempts: u32,

    #[serde(default = "default_mqtt_retry_delay_ms")]
    pub mqtt_retry_delay_ms: u64,

    // Engine
    #[serde(default = "default_liveness_sweep_interval_secs")]
    pub liveness_sweep_interval_secs: u64,

    #[serde(default = "default_command_sweep_interval_secs")]
    pub command_sweep_interval_secs: u64,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_command_retention_secs")]
    pub command_retention_secs: u64,

    #[serde(default = "default_ota_stall_timeout_secs")]
    pub ota_stall_timeout_secs: u64,

    #[serde(default = "default_dedup_window_size")]
    pub dedup_window_size: usize,

    /// Maximum entries per device/command table
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,

    #[serde(default = "default_device_idle_ttl_secs")]
    pub device_idle_ttl_secs: u64,

    #[serde(default = "default_fallback_send_interval_secs")]
    pub fallback_send_interval_secs: u64,

    #[serde(default = "default_fallback_hello_interval_secs")]
    pub fallback_hello_interval_secs: u64,

    /// Per-device timing, e.g. `dc-meter-007=10:30,dc-meter-008=5:60`
    #[serde(default)]
    pub device_timing_overrides: String,

    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Time given to draining processes after shutdown starts
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "railmeter".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_nats_envelope_stream() -> String {
    "envelopes".to_string()
}

fn default_nats_event_stream() -> String {
    "device_events".to_string()
}

fn default_nats_command_subject() -> String {
    "commands.requests".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    5
}

fn default_mqtt_broker_urls() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id_prefix() -> String {
    "railmeter".to_string()
}

fn default_mqtt_topic_root() -> String {
    "iot".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    30
}

fn default_mqtt_max_retry_attempts() -> u32 {
    0
}

fn default_mqtt_retry_delay_ms() -> u64 {
    2000
}

fn default_liveness_sweep_interval_secs() -> u64 {
    10
}

fn default_command_sweep_interval_secs() -> u64 {
    5
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_command_retention_secs() -> u64 {
    60 * 60
}

fn default_ota_stall_timeout_secs() -> u64 {
    15 * 60
}

fn default_dedup_window_size() -> usize {
    256
}

fn default_table_capacity() -> usize {
    50_000
}

fn default_device_idle_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_fallback_send_interval_secs() -> u64 {
    60
}

fn default_fallback_hello_interval_secs() -> u64 {
    120
}

fn default_outbox_capacity() -> usize {
    4096
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("RAILMETER"))
            .build()?
            .try_deserialize()
    }

    pub fn ingest_config(&self) -> TelemetryIngestConfig {
        TelemetryIngestConfig {
            topic_root: self.mqtt_topic_root.clone(),
            dedup_window_size: self.dedup_window_size,
            table_capacity: self.table_capacity,
            device_idle_ttl_secs: self.device_idle_ttl_secs,
            fallback_send_interval_secs: self.fallback_send_interval_secs,
            fallback_hello_interval_secs: self.fallback_hello_interval_secs,
            liveness_sweep_interval_secs: self.liveness_sweep_interval_secs,
            command_sweep_interval_secs: self.command_sweep_interval_secs,
            command_timeout_secs: self.command_timeout_secs,
            command_retention_secs: self.command_retention_secs,
            ota_stall_timeout_secs: self.ota_stall_timeout_secs,
            outbox_capacity: self.outbox_capacity,
        }
    }

    pub fn broker_urls(&self) -> Vec<String> {
        self.mqtt_broker_urls
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// One subscription per configured broker
    pub fn mqtt_subscriptions(&self) -> Vec<MqttConnectionConfig> {
        self.broker_urls()
            .into_iter()
            .enumerate()
            .map(|(i, url)| self.mqtt_connection(url, format!("{}-{}", self.mqtt_client_id_prefix, i)))
            .collect()
    }

    /// Commands go out through the first broker
    pub fn mqtt_command_connection(&self) -> Option<MqttConnectionConfig> {
        self.broker_urls()
            .into_iter()
            .next()
            .map(|url| self.mqtt_connection(url, format!("{}-cmd", self.mqtt_client_id_prefix)))
    }

    fn mqtt_connection(&self, broker_url: String, client_id: String) -> MqttConnectionConfig {
        MqttConnectionConfig {
            broker_url,
            client_id,
            keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs),
            max_retry_attempts: self.mqtt_max_retry_attempts,
            retry_delay: Duration::from_millis(self.mqtt_retry_delay_ms),
        }
    }
}
