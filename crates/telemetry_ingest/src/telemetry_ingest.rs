use crate::domain::{
    outbox, run_event_drain, run_sink_drain, CommandCorrelator, CommandService, CommandSweeper,
    IngestMetrics, IngestState, IngestionRouter, LivenessMonitor, LivenessSweeper,
    OtaSessionTracker, OutboxReceiver, OutboxSender, SequenceTracker, TelemetryIngestConfig,
};
use crate::mqtt::{run_mqtt_subscriber, MqttCommandConnection, MqttConnectionConfig};
use crate::nats::CommandRequestConsumer;
use common::domain::{
    CommandPublisher, DeviceRegistry, DomainEvent, DomainEventPublisher, DurableSink, StoreRecord,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type IngestProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// Outward-facing collaborators the engine depends on
pub struct IngestCollaborators {
    pub registry: Arc<dyn DeviceRegistry>,
    pub sink: Arc<dyn DurableSink>,
    pub event_publisher: Arc<dyn DomainEventPublisher>,
    pub command_publisher: Arc<dyn CommandPublisher>,
}

/// Broker-facing inputs that become long-running processes
#[derive(Default)]
pub struct IngestTransports {
    /// One subscription per broker
    pub subscriptions: Vec<MqttConnectionConfig>,
    pub command_connection: Option<MqttCommandConnection>,
    /// NATS client and subject for command requests
    pub command_requests: Option<(async_nats::Client, String)>,
}

/// Ingestion engine: shared state tables, the ingestion router, the command
/// service and the outboxes feeding the durable sink and the event stream.
pub struct TelemetryIngest {
    config: TelemetryIngestConfig,
    state: IngestState,
    router: IngestionRouter,
    command_service: Arc<CommandService>,
    events: OutboxSender<DomainEvent>,
    sink_outbox: OutboxReceiver<StoreRecord>,
    event_outbox: OutboxReceiver<DomainEvent>,
    sink: Arc<dyn DurableSink>,
    event_publisher: Arc<dyn DomainEventPublisher>,
}

impl TelemetryIngest {
    pub fn new(config: TelemetryIngestConfig, collaborators: IngestCollaborators) -> Self {
        let idle_ttl = config.device_idle_ttl();
        let capacity = config.table_capacity;

        let ota = Arc::new(OtaSessionTracker::new(
            capacity,
            idle_ttl,
            config.ota_stall_timeout(),
        ));
        let state = IngestState {
            tracker: Arc::new(SequenceTracker::new(config.dedup_window_size, capacity, idle_ttl)),
            liveness: Arc::new(LivenessMonitor::new(
                collaborators.registry,
                config.fallback_timing(),
                capacity,
                idle_ttl,
            )),
            correlator: Arc::new(CommandCorrelator::new(
                Arc::clone(&ota),
                config.command_timeout(),
                config.command_retention(),
                capacity,
            )),
            ota,
            metrics: Arc::new(IngestMetrics::new()),
        };

        let (sink_tx, sink_outbox) = outbox("sink", config.outbox_capacity);
        let (events, event_outbox) = outbox("events", config.outbox_capacity);

        let router = IngestionRouter::new(
            config.topic_root.clone(),
            state.clone(),
            sink_tx,
            events.clone(),
        );
        let command_service = Arc::new(CommandService::new(
            Arc::clone(&state.correlator),
            collaborators.command_publisher,
            events.clone(),
        ));

        Self {
            config,
            state,
            router,
            command_service,
            events,
            sink_outbox,
            event_outbox,
            sink: collaborators.sink,
            event_publisher: collaborators.event_publisher,
        }
    }

    pub fn router(&self) -> IngestionRouter {
        self.router.clone()
    }

    pub fn command_service(&self) -> Arc<CommandService> {
        Arc::clone(&self.command_service)
    }

    pub fn state(&self) -> &IngestState {
        &self.state
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.state.metrics)
    }

    /// Split the engine into named runner processes.
    ///
    /// The drains ignore cancellation: they stop once every producer
    /// (subscribers, sweepers and the command surface) has stopped and the
    /// outboxes are empty.
    pub fn into_runner_processes(self, transports: IngestTransports) -> Vec<(String, IngestProcess)> {
        let mut processes: Vec<(String, IngestProcess)> = Vec::new();
        let topic_root = self.config.topic_root.clone();

        for (i, subscription) in transports.subscriptions.into_iter().enumerate() {
            let router = self.router.clone();
            let topic_root = topic_root.clone();
            processes.push((
                format!("mqtt_subscriber_{}", i),
                boxed_process(move |ctx| run_mqtt_subscriber(subscription, topic_root, router, ctx)),
            ));
        }

        if let Some(connection) = transports.command_connection {
            processes.push((
                "mqtt_command_connection".to_string(),
                boxed_process(move |ctx| connection.run(ctx)),
            ));
        }

        if let Some((client, subject)) = transports.command_requests {
            let consumer = CommandRequestConsumer::new(client, subject, Arc::clone(&self.command_service));
            processes.push((
                "command_requests".to_string(),
                boxed_process(move |ctx| consumer.run(ctx)),
            ));
        }

        let liveness = LivenessSweeper::new(
            self.state.clone(),
            self.events.clone(),
            self.config.liveness_sweep_interval(),
        );
        processes.push((
            "liveness_sweeper".to_string(),
            boxed_process(move |ctx| liveness.run(ctx)),
        ));

        let commands = CommandSweeper::new(
            self.state.clone(),
            self.events,
            self.config.command_sweep_interval(),
        );
        processes.push((
            "command_sweeper".to_string(),
            boxed_process(move |ctx| commands.run(ctx)),
        ));

        let (sink_outbox, sink, metrics) = (self.sink_outbox, self.sink, Arc::clone(&self.state.metrics));
        processes.push((
            "sink_drain".to_string(),
            boxed_process(move |_ctx| run_sink_drain(sink_outbox, sink, metrics)),
        ));

        let (event_outbox, publisher, metrics) = (
            self.event_outbox,
            self.event_publisher,
            Arc::clone(&self.state.metrics),
        );
        processes.push((
            "event_drain".to_string(),
            boxed_process(move |_ctx| run_event_drain(event_outbox, publisher, metrics)),
        ));

        info!(processes = processes.len(), "telemetry ingest assembled");
        processes
    }
}

fn boxed_process<F, Fut>(process: F) -> IngestProcess
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(process(ctx)))
}
