use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::domain::{
    CommandKind, CommandPublisher, CommandRequest, CommandStatus, ConnectionStatus, DeviceCommand,
    DeviceRegistry, DeviceTimingConfig, DomainError, DomainEvent, DomainEventPublisher,
    DomainResult, DurableSink, OfflineReason, StoreRecord,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use telemetry_ingest::domain::{Classification, RouteOutcome, TelemetryIngestConfig};
use telemetry_ingest::telemetry_ingest::{IngestCollaborators, IngestTransports, TelemetryIngest};
use tokio_util::sync::CancellationToken;

const DEVICE: &str = "dc-meter-007";

mod recorders {
    use super::*;

    #[derive(Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<StoreRecord>>,
        pub flushes: Mutex<usize>,
    }

    #[async_trait]
    impl DurableSink for RecordingSink {
        async fn store(&self, record: &StoreRecord) -> DomainResult<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn flush(&self) -> DomainResult<()> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingEvents {
        pub events: Mutex<Vec<DomainEvent>>,
    }

    #[async_trait]
    impl DomainEventPublisher for RecordingEvents {
        async fn publish_event(&self, event: &DomainEvent) -> DomainResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingCommands {
        pub payloads: Mutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl CommandPublisher for RecordingCommands {
        async fn publish_command(&self, command: &DeviceCommand, payload: Vec<u8>) -> DomainResult<()> {
            let wire = serde_json::from_slice(&payload)
                .map_err(|e| DomainError::CommandPublishFailed(e.to_string()))?;
            self.payloads
                .lock()
                .unwrap()
                .push((command.device_id.clone(), wire));
            Ok(())
        }
    }

    pub struct FixedTimings(pub DeviceTimingConfig);

    #[async_trait]
    impl DeviceRegistry for FixedTimings {
        async fn get_device_timing_config(&self, _device_id: &str) -> DomainResult<Option<DeviceTimingConfig>> {
            Ok(Some(self.0))
        }
    }
}

use recorders::*;

struct Engine {
    ingest: TelemetryIngest,
    sink: Arc<RecordingSink>,
    events: Arc<RecordingEvents>,
    commands: Arc<RecordingCommands>,
}

fn engine(timing: DeviceTimingConfig) -> Engine {
    let sink = Arc::new(RecordingSink::default());
    let events = Arc::new(RecordingEvents::default());
    let commands = Arc::new(RecordingCommands::default());
    let ingest = TelemetryIngest::new(
        TelemetryIngestConfig::default(),
        IngestCollaborators {
            registry: Arc::new(FixedTimings(timing)),
            sink: sink.clone(),
            event_publisher: events.clone(),
            command_publisher: commands.clone(),
        },
    );
    Engine {
        ingest,
        sink,
        events,
        commands,
    }
}

/// Run the engine's processes to completion so both outboxes are drained
async fn shut_down(ingest: TelemetryIngest) {
    let ctx = CancellationToken::new();
    let handles: Vec<_> = ingest
        .into_runner_processes(IngestTransports::default())
        .into_iter()
        .map(|(_, process)| tokio::spawn(process(ctx.clone())))
        .collect();
    ctx.cancel();
    for handle in handles {
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("process did not stop")
            .unwrap()
            .unwrap();
    }
}

fn telemetry(seq: u32) -> Vec<u8> {
    json!({
        "v": 2, "device_id": DEVICE, "ts": "2025-03-01T10:00:00Z", "seq": seq,
        "msg_type": "telemetry",
        "measurements": [{"ts": "2025-03-01T10:00:00Z", "type": "voltage_dc", "val": 750.0, "unit": "V"}]
    })
    .to_string()
    .into_bytes()
}

fn ack(seq: u32, command_id: &str, result: &str) -> Vec<u8> {
    json!({
        "v": 2, "device_id": DEVICE, "ts": "2025-03-01T10:00:00Z", "seq": seq,
        "msg_type": "command_ack", "cmd_id": command_id, "result": result
    })
    .to_string()
    .into_bytes()
}

fn start_ota() -> CommandRequest {
    CommandRequest {
        device_id: DEVICE.to_string(),
        kind: CommandKind::StartOta,
        params: json!({"fw_version": "2.1.0"}).as_object().unwrap().clone(),
        command_id: None,
    }
}

const TELEMETRY_TOPIC: &str = "iot/dc-meter-007/telemetry";

#[tokio::test]
async fn dual_broker_replay_stores_each_sequence_once() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let n = 200u32;

    let feeds: Vec<_> = (0..2)
        .map(|_| {
            let router = e.ingest.router();
            tokio::spawn(async move {
                for seq in 0..=n {
                    router
                        .route(TELEMETRY_TOPIC, &telemetry(seq), Utc::now())
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for feed in feeds {
        feed.await.unwrap();
    }

    let metrics = e.ingest.metrics();
    assert_eq!(metrics.snapshot().new_messages, u64::from(n) + 1);
    assert_eq!(metrics.snapshot().duplicates_dropped, u64::from(n) + 1);
    assert_eq!(metrics.snapshot().gaps_detected, 0);
    assert_eq!(e.ingest.state().tracker.highest_contiguous_seq(DEVICE), i64::from(n));

    shut_down(e.ingest).await;
    assert_eq!(e.sink.records.lock().unwrap().len(), n as usize + 1);
    assert_eq!(*e.sink.flushes.lock().unwrap(), 1);
}

#[tokio::test]
async fn same_message_from_two_brokers_is_stored_once() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let primary = e.ingest.router();
    let secondary = e.ingest.router();
    let now = Utc::now();

    let (payload_a, payload_b) = (telemetry(142), telemetry(142));
    let (a, b) = tokio::join!(
        primary.route(TELEMETRY_TOPIC, &payload_a, now),
        secondary.route(TELEMETRY_TOPIC, &payload_b, now),
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|outcome| matches!(outcome, RouteOutcome::Duplicate));
    assert_eq!(
        outcomes,
        vec![RouteOutcome::Stored(Classification::New), RouteOutcome::Duplicate]
    );
    drop((primary, secondary));

    shut_down(e.ingest).await;
    let records = e.sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].envelope.sequence, Some(142));
}

#[tokio::test]
async fn gap_is_reported_once_and_late_arrival_fills_it() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let router = e.ingest.router();
    let now = Utc::now();

    let mut outcomes = Vec::new();
    for seq in [0, 1, 3, 2] {
        outcomes.push(router.route(TELEMETRY_TOPIC, &telemetry(seq), now).await.unwrap());
    }
    assert_eq!(
        outcomes,
        vec![
            RouteOutcome::Stored(Classification::New),
            RouteOutcome::Stored(Classification::New),
            RouteOutcome::Stored(Classification::Gap {
                missing_from: 2,
                missing_to: 2
            }),
            RouteOutcome::Stored(Classification::New),
        ]
    );
    assert_eq!(e.ingest.state().tracker.highest_contiguous_seq(DEVICE), 3);
    drop(router);

    shut_down(e.ingest).await;
    let gaps = e
        .events
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| matches!(event, DomainEvent::SequenceGapDetected { .. }))
        .count();
    assert_eq!(gaps, 1);
}

#[tokio::test]
async fn sequence_wrap_is_contiguous() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let router = e.ingest.router();
    let now = Utc::now();

    for seq in [u32::MAX - 1, u32::MAX, 0, 1] {
        let outcome = router.route(TELEMETRY_TOPIC, &telemetry(seq), now).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Stored(Classification::New), "seq {}", seq);
    }
    assert_eq!(e.ingest.metrics().snapshot().gaps_detected, 0);
    assert_eq!(e.ingest.state().tracker.highest_contiguous_seq(DEVICE), 1);
}

#[tokio::test]
async fn device_goes_offline_after_twice_its_longest_interval() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let router = e.ingest.router();
    let start: DateTime<Utc> = Utc::now();

    router.route(TELEMETRY_TOPIC, &telemetry(1), start).await.unwrap();
    let liveness = &e.ingest.state().liveness;
    assert_eq!(liveness.status(DEVICE), ConnectionStatus::Online);
    assert_eq!(liveness.effective_timeout(DEVICE), Some(Duration::seconds(60)));

    assert!(liveness.sweep(start + Duration::seconds(60)).is_empty());
    let events = liveness.sweep(start + Duration::seconds(61));
    assert!(matches!(
        events[..],
        [DomainEvent::DeviceOffline { reason: OfflineReason::Timeout, .. }]
    ));
    assert!(liveness.sweep(start + Duration::seconds(120)).is_empty());

    router
        .route(TELEMETRY_TOPIC, &telemetry(2), start + Duration::seconds(130))
        .await
        .unwrap();
    assert_eq!(liveness.status(DEVICE), ConnectionStatus::Online);
}

#[tokio::test]
async fn announced_offline_bypasses_timeout() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let router = e.ingest.router();
    let now = Utc::now();

    router.route(TELEMETRY_TOPIC, &telemetry(1), now).await.unwrap();
    let will = json!({"v": 2, "device_id": DEVICE, "status": "offline", "ts": "2025-03-01T10:00:05Z"});
    router
        .route("iot/dc-meter-007/status", will.to_string().as_bytes(), now)
        .await
        .unwrap();
    assert_eq!(e.ingest.state().liveness.status(DEVICE), ConnectionStatus::Offline);
    drop(router);

    shut_down(e.ingest).await;
    let events = e.events.events.lock().unwrap();
    assert!(events.iter().any(|event| matches!(
        event,
        DomainEvent::DeviceOffline { reason: OfflineReason::Announced, .. }
    )));
}

#[tokio::test]
async fn only_one_ota_session_per_device() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let service = e.ingest.command_service();

    let first = service.send_command(start_ota()).await.unwrap();
    let err = service.send_command(start_ota()).await.unwrap_err();
    assert!(matches!(err, DomainError::OtaInProgress { .. }));
    assert_eq!(e.commands.payloads.lock().unwrap().len(), 1);

    // A rejected start_ota ends the session, so a new upgrade may begin
    e.ingest
        .router()
        .route(
            "iot/dc-meter-007/command/ack",
            &ack(1, &first.command_id, "rejected"),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(e.ingest.state().ota.active_session(DEVICE).is_none());
    service.send_command(start_ota()).await.unwrap();

    let payloads = e.commands.payloads.lock().unwrap();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].1["cmd"], "start_ota");
    assert_eq!(payloads[0].1["params"]["fw_version"], "2.1.0");
}

#[tokio::test]
async fn late_ack_does_not_revive_timed_out_command() {
    let e = engine(DeviceTimingConfig::new(10, 30));
    let service = e.ingest.command_service();
    let command = service
        .send_command(CommandRequest {
            device_id: DEVICE.to_string(),
            kind: CommandKind::Reboot,
            params: Default::default(),
            command_id: Some("cmd-1".to_string()),
        })
        .await
        .unwrap();

    let correlator = &e.ingest.state().correlator;
    let timed_out = correlator.sweep(Utc::now() + Duration::seconds(31));
    assert!(matches!(timed_out[..], [DomainEvent::CommandTimedOut { .. }]));
    assert_eq!(correlator.pending_count(), 0);

    let router = e.ingest.router();
    router
        .route("iot/dc-meter-007/command/ack", &ack(1, &command.command_id, "accepted"), Utc::now())
        .await
        .unwrap();
    assert_eq!(correlator.pending_count(), 0);
    assert_ne!(correlator.status("cmd-1"), Some(CommandStatus::Pending));

    router
        .route("iot/dc-meter-007/command/ack", &ack(2, &command.command_id, "accepted"), Utc::now())
        .await
        .unwrap();
    assert_eq!(correlator.pending_count(), 0);
    assert_eq!(e.ingest.metrics().snapshot().stale_acks, 1);
}
