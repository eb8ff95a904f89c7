mod config;

use common::nats::NatsClient;
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use config::ServiceConfig;
use railmeter_runner::Runner;
use std::sync::Arc;
use std::time::Duration;
use telemetry_ingest::domain::StaticDeviceRegistry;
use telemetry_ingest::mqtt::MqttCommandPublisher;
use telemetry_ingest::nats::{NatsDomainEventPublisher, NatsEnvelopeSink};
use telemetry_ingest::telemetry_ingest::{IngestCollaborators, IngestTransports, TelemetryIngest};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    // Initialize configuration and tracing
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        otel_enabled = config.otel_enabled,
        brokers = config.broker_urls().len(),
        topic_root = %config.mqtt_topic_root,
        "Starting railmeter ingest service"
    );
    debug!("Configuration: {:?}", config);

    let registry = match StaticDeviceRegistry::from_overrides(&config.device_timing_overrides) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Invalid device timing overrides: {}", e);
            std::process::exit(1);
        }
    };
    info!(devices = registry.len(), "loaded device timing overrides");

    let nats_client = match initialize_nats(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to initialize NATS: {}", e);
            std::process::exit(1);
        }
    };

    let Some(command_connection_config) = config.mqtt_command_connection() else {
        error!("No MQTT broker configured");
        std::process::exit(1);
    };
    let (command_publisher, command_connection) =
        match MqttCommandPublisher::new(command_connection_config, config.mqtt_topic_root.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to create MQTT command publisher: {}", e);
                std::process::exit(1);
            }
        };

    let publisher_client = nats_client.create_publisher_client();
    let ingest = TelemetryIngest::new(
        config.ingest_config(),
        IngestCollaborators {
            registry: Arc::new(registry),
            sink: Arc::new(NatsEnvelopeSink::new(
                Arc::clone(&publisher_client),
                config.nats_envelope_stream.clone(),
            )),
            event_publisher: Arc::new(NatsDomainEventPublisher::new(
                publisher_client,
                config.nats_event_stream.clone(),
            )),
            command_publisher: Arc::new(command_publisher),
        },
    );
    let metrics = ingest.metrics();

    let processes = ingest.into_runner_processes(IngestTransports {
        subscriptions: config.mqtt_subscriptions(),
        command_connection: Some(command_connection),
        command_requests: Some((nats_client.client(), config.nats_command_subject.clone())),
    });

    let mut runner = Runner::new().with_shutdown_grace(Duration::from_secs(config.shutdown_grace_secs));
    for (name, process) in processes {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer({
            let nats_for_close = Arc::clone(&nats_client);
            move || async move {
                info!("Running cleanup tasks...");
                info!(metrics = ?metrics.snapshot(), "final ingest metrics");

                if let Err(e) = nats_for_close.close().await {
                    error!("Failed to close NATS connection: {}", e);
                }

                // Shutdown telemetry and flush pending traces and logs
                shutdown_telemetry(telemetry_providers);

                info!("Cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

async fn initialize_nats(config: &ServiceConfig) -> anyhow::Result<Arc<NatsClient>> {
    info!("Initializing NATS...");
    let nats_client = Arc::new(
        NatsClient::connect(
            &config.nats_url,
            Duration::from_secs(config.startup_timeout_secs),
        )
        .await?,
    );
    nats_client
        .ensure_stream(&config.nats_envelope_stream, "Deduplicated device envelopes")
        .await?;
    nats_client
        .ensure_stream(&config.nats_event_stream, "Device liveness, command and OTA events")
        .await?;
    Ok(nats_client)
}
