mod bounded_table;
mod codec;
mod command_correlator;
mod command_service;
mod ingest_metrics;
mod ingestion_router;
mod liveness_monitor;
mod ota_sessions;
mod outbox;
mod sequence_tracker;
mod static_device_registry;
mod sweeper;
mod telemetry_ingest_config;

pub use bounded_table::*;
pub use codec::*;
pub use command_correlator::*;
pub use command_service::*;
pub use ingest_metrics::*;
pub use ingestion_router::*;
pub use liveness_monitor::*;
pub use ota_sessions::*;
pub use outbox::*;
pub use sequence_tracker::*;
pub use static_device_registry::*;
pub use sweeper::*;
pub use telemetry_ingest_config::TelemetryIngestConfig;
