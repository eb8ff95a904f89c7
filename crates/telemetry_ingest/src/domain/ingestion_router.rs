use crate::domain::{
    decode, AckOutcome, Classification, CommandCorrelator, DecodeError, DecodeErrorReason,
    IngestMetrics, LivenessMonitor, OtaSessionTracker, OutboxSender, SequenceTracker,
};
use crate::mqtt::parse_topic;
use chrono::{DateTime, Utc};
use common::domain::{
    CommandAckReport, DomainError, DomainEvent, DomainResult, Envelope, MessageBody,
    OtaStatusReport, ReportedStatus, StoreRecord,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn, Span};

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// New data, handed to the durable sink (a gap classification still stores)
    Stored(Classification),
    /// Already delivered through another path; dropped
    Duplicate,
    /// Undecodable; dropped after a `DecodeFailed` event
    Rejected,
}

/// Shared state tables the router and the sweeps operate on
#[derive(Clone)]
pub struct IngestState {
    pub tracker: Arc<SequenceTracker>,
    pub liveness: Arc<LivenessMonitor>,
    pub correlator: Arc<CommandCorrelator>,
    pub ota: Arc<OtaSessionTracker>,
    pub metrics: Arc<IngestMetrics>,
}

/// Single ingestion path shared by every broker subscription.
///
/// Messages for the same device may arrive concurrently from several
/// brokers; per-device state is only touched through the sharded tables,
/// and the dedup classification collapses repeated deliveries into one.
#[derive(Clone)]
pub struct IngestionRouter {
    topic_root: String,
    state: IngestState,
    sink: OutboxSender<StoreRecord>,
    events: OutboxSender<DomainEvent>,
}

impl IngestionRouter {
    pub fn new(
        topic_root: impl Into<String>,
        state: IngestState,
        sink: OutboxSender<StoreRecord>,
        events: OutboxSender<DomainEvent>,
    ) -> Self {
        Self {
            topic_root: topic_root.into(),
            state,
            sink,
            events,
        }
    }

    /// Process one raw broker message to completion.
    ///
    /// Per-message problems are counted, logged and surfaced as events. Only
    /// errors for which [`DomainError::is_fatal`] holds are returned.
    #[instrument(skip(self, payload), fields(topic = %topic, device_id = tracing::field::Empty))]
    pub async fn route(&self, topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> DomainResult<RouteOutcome> {
        self.state.metrics.mark_received();

        match self.route_message(topic, payload, received_at).await {
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "message processing failed");
                Ok(RouteOutcome::Rejected)
            }
            other => other,
        }
    }

    async fn route_message(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> DomainResult<RouteOutcome> {
        let parsed = match parse_topic(&self.topic_root, topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = DecodeError {
                    reason: DecodeErrorReason::InvalidTopic(e.to_string()),
                    raw_size_bytes: payload.len(),
                };
                return self.reject(topic, error).await;
            }
        };

        Span::current().record("device_id", parsed.device_id.as_str());

        let decoded = match decode(payload, &parsed, received_at) {
            Ok(decoded) => decoded,
            Err(e) => return self.reject(topic, e).await,
        };
        let envelope = decoded.envelope;
        let device_id = envelope.device_id.clone();

        // Duplicates prove liveness too, so this runs before classification
        let liveness_event = self.observe_liveness(&envelope, received_at).await?;
        self.emit(liveness_event).await?;

        let classification =
            self.state
                .tracker
                .classify(&device_id, envelope.dedup_sequence(), received_at)?;

        match classification {
            Classification::Duplicate => {
                self.state.metrics.mark_duplicate();
                debug!(device_id = %device_id, sequence = ?envelope.sequence, "duplicate dropped");
                return Ok(RouteOutcome::Duplicate);
            }
            Classification::Gap {
                missing_from,
                missing_to,
            } => {
                self.state.metrics.mark_gap();
                warn!(device_id = %device_id, missing_from, missing_to, "sequence gap detected");
                self.emit(Some(DomainEvent::SequenceGapDetected {
                    device_id: device_id.clone(),
                    missing_from,
                    missing_to,
                }))
                .await?;
            }
            Classification::New => {}
        }
        self.state.metrics.mark_new();

        match &envelope.body {
            MessageBody::CommandAck(ack) => self.forward_ack(&device_id, ack, received_at).await?,
            MessageBody::OtaStatus(report) => self.forward_ota(&device_id, report, received_at).await?,
            _ => {}
        }

        debug!(device_id = %device_id, sequence = envelope.sequence_or_legacy(), ?classification, "message accepted");
        self.sink
            .send(StoreRecord {
                device_id,
                message_type: envelope.message_type,
                envelope,
                payload: decoded.payload,
                received_at,
            })
            .await?;

        Ok(RouteOutcome::Stored(classification))
    }

    async fn observe_liveness(
        &self,
        envelope: &Envelope,
        received_at: DateTime<Utc>,
    ) -> DomainResult<Option<DomainEvent>> {
        let MessageBody::Status(report) = &envelope.body else {
            return self.state.liveness.touch(&envelope.device_id, received_at).await;
        };

        if report.status == ReportedStatus::Online
            && self
                .state
                .tracker
                .announce_session(&envelope.device_id, envelope.timestamp, received_at)?
        {
            info!(device_id = %envelope.device_id, announced_at = %envelope.timestamp, "device announced online, possible restart");
        }
        self.state
            .liveness
            .observe_status(&envelope.device_id, report.status, received_at)
            .await
    }

    async fn forward_ack(&self, device_id: &str, ack: &CommandAckReport, now: DateTime<Utc>) -> DomainResult<()> {
        let (outcome, ota_event) = match self.state.correlator.on_ack(device_id, ack, now) {
            Ok(correlated) => correlated,
            Err(e @ DomainError::StaleAck { .. }) => {
                self.state.metrics.mark_stale_ack();
                warn!(device_id = %device_id, command_id = %ack.command_id, error = %e, "stale command ack");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let AckOutcome::LateAfterTimeout(status) = outcome {
            info!(device_id = %device_id, command_id = %ack.command_id, status = %status.as_str(), "ack arrived after timeout");
        }
        self.emit(Some(DomainEvent::CommandAcked {
            command_id: ack.command_id.clone(),
            device_id: device_id.to_string(),
            result: ack.result,
            detail: ack.detail.clone(),
        }))
        .await?;
        self.emit(ota_event).await
    }

    async fn forward_ota(&self, device_id: &str, report: &OtaStatusReport, now: DateTime<Utc>) -> DomainResult<()> {
        match self.state.ota.apply_report(device_id, report, now) {
            Ok(events) => {
                for event in events {
                    self.emit(Some(event)).await?;
                }
                Ok(())
            }
            Err(e @ DomainError::OtaTransitionRejected { .. }) => {
                self.state.metrics.mark_ota_report_rejected();
                warn!(device_id = %device_id, command_id = %report.command_id, error = %e, "OTA report rejected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn reject(&self, topic: &str, error: DecodeError) -> DomainResult<RouteOutcome> {
        self.state.metrics.mark_decode_failure();
        warn!(topic = %topic, error = %error, "failed to decode device message");
        self.emit(Some(DomainEvent::DecodeFailed {
            topic: topic.to_string(),
            reason: error.reason.to_string(),
        }))
        .await?;
        Ok(RouteOutcome::Rejected)
    }

    async fn emit(&self, event: Option<DomainEvent>) -> DomainResult<()> {
        match event {
            Some(event) => self.events.send(event).await,
            None => Ok(()),
        }
    }
}
