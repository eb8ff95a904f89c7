use crate::domain::{encode_command, CommandCorrelator, CommandRecord, OutboxSender};
use chrono::Utc;
use common::domain::{
    CommandPublisher, CommandRequest, DeviceCommand, DomainError, DomainEvent, DomainResult,
};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

/// Domain service that sends commands to devices and answers status queries
pub struct CommandService {
    correlator: Arc<CommandCorrelator>,
    publisher: Arc<dyn CommandPublisher>,
    events: OutboxSender<DomainEvent>,
}

impl CommandService {
    pub fn new(
        correlator: Arc<CommandCorrelator>,
        publisher: Arc<dyn CommandPublisher>,
        events: OutboxSender<DomainEvent>,
    ) -> Self {
        Self {
            correlator,
            publisher,
            events,
        }
    }

    /// Dispatch, encode and publish a command.
    ///
    /// Synchronous rejections (`OtaInProgress`, `InvalidCommand`,
    /// `DuplicateCommandId`) are returned before anything is published.
    #[instrument(skip(self, request), fields(device_id = %request.device_id, command = %request.kind))]
    pub async fn send_command(&self, request: CommandRequest) -> DomainResult<DeviceCommand> {
        debug!("dispatching command");
        let command = self.correlator.dispatch(request, Utc::now())?;

        let published = match encode_command(&command) {
            Ok(payload) => self.publisher.publish_command(&command, payload).await,
            Err(e) => Err(DomainError::CommandPublishFailed(format!(
                "failed to encode command: {}",
                e
            ))),
        };

        if let Err(e) = published {
            error!(command_id = %command.command_id, error = %e, "failed to publish command");
            if let Some(event) =
                self.correlator
                    .mark_publish_failed(&command.command_id, e.to_string(), Utc::now())
            {
                self.events.send(event).await?;
            }
            return Err(DomainError::CommandPublishFailed(format!(
                "command {}: {}",
                command.command_id, e
            )));
        }

        info!(command_id = %command.command_id, "command published");
        Ok(command)
    }

    pub fn command_status(&self, command_id: &str) -> DomainResult<CommandRecord> {
        self.correlator
            .record(command_id)
            .ok_or_else(|| DomainError::CommandNotFound(command_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{outbox, OtaSessionTracker, OutboxReceiver};
    use common::domain::{CommandKind, CommandStatus, MockCommandPublisher, OtaState};
    use serde_json::json;

    const DEVICE: &str = "dc-meter-007";

    fn service(
        publisher: MockCommandPublisher,
    ) -> (CommandService, Arc<OtaSessionTracker>, OutboxReceiver<DomainEvent>) {
        let ota = Arc::new(OtaSessionTracker::new(
            100,
            chrono::Duration::hours(1),
            chrono::Duration::minutes(15),
        ));
        let correlator = Arc::new(CommandCorrelator::new(
            Arc::clone(&ota),
            chrono::Duration::seconds(30),
            chrono::Duration::hours(1),
            100,
        ));
        let (events, rx) = outbox("events", 16);
        (CommandService::new(correlator, Arc::new(publisher), events), ota, rx)
    }

    fn start_ota(device_id: &str) -> CommandRequest {
        CommandRequest {
            device_id: device_id.to_string(),
            kind: CommandKind::StartOta,
            params: json!({"fw_version": "2.1.0"}).as_object().unwrap().clone(),
            command_id: None,
        }
    }

    #[tokio::test]
    async fn test_send_command_publishes_wire_payload() {
        let mut publisher = MockCommandPublisher::new();
        publisher
            .expect_publish_command()
            .withf(|command, payload| {
                let wire: serde_json::Value = serde_json::from_slice(payload).unwrap();
                command.device_id == DEVICE
                    && wire["v"] == 2
                    && wire["cmd"] == "reboot"
                    && wire["cmd_id"] == command.command_id.as_str()
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let (service, _, _events) = service(publisher);

        let command = service
            .send_command(CommandRequest {
                device_id: DEVICE.to_string(),
                kind: CommandKind::Reboot,
                params: Default::default(),
                command_id: None,
            })
            .await
            .unwrap();

        let record = service.command_status(&command.command_id).unwrap();
        assert_eq!(record.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_ota_for_same_device_is_refused() {
        let mut publisher = MockCommandPublisher::new();
        publisher
            .expect_publish_command()
            .times(2)
            .returning(|_, _| Ok(()));
        let (service, _, _events) = service(publisher);

        service.send_command(start_ota(DEVICE)).await.unwrap();
        let err = service.send_command(start_ota(DEVICE)).await.unwrap_err();
        assert!(matches!(err, DomainError::OtaInProgress { .. }));

        service.send_command(start_ota("dc-meter-008")).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_failure_marks_error_and_releases_ota() {
        let mut publisher = MockCommandPublisher::new();
        publisher
            .expect_publish_command()
            .times(1)
            .returning(|_, _| Err(DomainError::RepositoryError(anyhow::anyhow!("broker down"))));
        let (service, ota, mut events) = service(publisher);

        let mut request = start_ota(DEVICE);
        request.command_id = Some("ota-1".to_string());
        let err = service.send_command(request).await.unwrap_err();
        assert!(matches!(err, DomainError::CommandPublishFailed(_)));

        let record = service.command_status("ota-1").unwrap();
        assert_eq!(record.status, CommandStatus::Error);
        assert!(ota.active_session(DEVICE).is_none());
        assert_eq!(ota.session(DEVICE, "ota-1").unwrap().state, OtaState::Failed);
        assert!(matches!(
            events.try_recv(),
            Some(DomainEvent::OtaStateChanged { state: OtaState::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_published() {
        let mut publisher = MockCommandPublisher::new();
        publisher.expect_publish_command().never();
        let (service, _, _events) = service(publisher);

        let mut request = start_ota(DEVICE);
        request.params.clear();
        let err = service.send_command(request).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidCommand(_)));
    }

    #[test]
    fn test_unknown_command_status() {
        let (service, _, _events) = service(MockCommandPublisher::new());
        assert!(matches!(
            service.command_status("missing"),
            Err(DomainError::CommandNotFound(_))
        ));
    }
}
