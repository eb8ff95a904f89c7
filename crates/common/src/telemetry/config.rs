use opentelemetry_sdk::{logs::LoggerProvider, trace::TracerProvider as SdkTracerProvider};

/// Settings for log output and optional OTLP export
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: String,
    pub otel_enabled: bool,
    pub otel_endpoint: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "railmeter-ingest".to_string(),
            log_level: "info".to_string(),
            otel_enabled: false,
            otel_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

/// Handles kept alive until shutdown so buffered spans and logs get flushed
pub struct TelemetryProviders {
    pub tracer_provider: SdkTracerProvider,
    pub logger_provider: LoggerProvider,
}
