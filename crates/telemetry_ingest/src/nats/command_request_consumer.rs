use crate::domain::{CommandRecord, CommandService};
use anyhow::{Context, Result};
use common::domain::{CommandRequest, DeviceCommand, DomainError};
use common::nats::set_parent_from_headers;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandApiRequest {
    Status { status_of: String },
    Send(CommandRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReplyError {
    pub kind: &'static str,
    pub message: String,
}

/// Reply sent back on the request's reply subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<DeviceCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<CommandRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandReplyError>,
}

impl CommandReply {
    fn failed(kind: &'static str, message: String) -> Self {
        Self {
            ok: false,
            command: None,
            record: None,
            error: Some(CommandReplyError { kind, message }),
        }
    }
}

impl From<&DomainError> for CommandReplyError {
    fn from(e: &DomainError) -> Self {
        let kind = match e {
            DomainError::OtaInProgress { .. } => "ota_in_progress",
            DomainError::InvalidCommand(_) => "invalid_command",
            DomainError::DuplicateCommandId(_) => "duplicate_command_id",
            DomainError::CommandNotFound(_) => "command_not_found",
            DomainError::CommandPublishFailed(_) => "command_publish_failed",
            DomainError::CapacityExhausted { .. } => "capacity_exhausted",
            _ => "internal",
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

/// Request/reply listener through which upstream services submit device
/// commands and look up their status.
///
/// A request body is either a command (`{"device_id", "cmd", "params",
/// "cmd_id"?}`) or a status query (`{"status_of": "<cmd_id>"}`).
pub struct CommandRequestConsumer {
    client: async_nats::Client,
    subject: String,
    service: Arc<CommandService>,
}

impl CommandRequestConsumer {
    pub fn new(client: async_nats::Client, subject: String, service: Arc<CommandService>) -> Self {
        Self {
            client,
            subject,
            service,
        }
    }

    pub async fn run(self, ctx: CancellationToken) -> Result<()> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .with_context(|| format!("failed to subscribe to {}", self.subject))?;
        info!(subject = %self.subject, "listening for command requests");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else {
                        warn!(subject = %self.subject, "command request subscription closed");
                        break;
                    };
                    self.handle_message(message).await;
                }
            }
        }

        if let Err(e) = subscriber.unsubscribe().await {
            debug!(error = %e, "failed to unsubscribe command requests");
        }
        info!("command request consumer stopped");
        Ok(())
    }

    async fn handle_message(&self, message: async_nats::Message) {
        let span = info_span!("command_request", subject = %message.subject, payload_size = message.payload.len());

        async {
            if let Some(headers) = &message.headers {
                set_parent_from_headers(headers);
            }

            let reply = handle_command_request(&self.service, &message.payload).await;
            let Some(reply_subject) = message.reply.clone() else {
                debug!(ok = reply.ok, "command request had no reply subject");
                return;
            };

            match serde_json::to_vec(&reply) {
                Ok(body) => {
                    if let Err(e) = self.client.publish(reply_subject, body.into()).await {
                        error!(error = %e, "failed to send command reply");
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize command reply"),
            }
        }
        .instrument(span)
        .await
    }
}

/// Decode and execute one command request
pub async fn handle_command_request(service: &CommandService, payload: &[u8]) -> CommandReply {
    let request: CommandApiRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed command request");
            return CommandReply::failed("malformed_request", e.to_string());
        }
    };

    let result = match request {
        CommandApiRequest::Send(request) => service.send_command(request).await.map(|command| CommandReply {
            ok: true,
            command: Some(command),
            record: None,
            error: None,
        }),
        CommandApiRequest::Status { status_of } => service.command_status(&status_of).map(|record| CommandReply {
            ok: true,
            command: None,
            record: Some(record),
            error: None,
        }),
    };

    result.unwrap_or_else(|e| {
        warn!(error = %e, "command request refused");
        CommandReply {
            ok: false,
            command: None,
            record: None,
            error: Some(CommandReplyError::from(&e)),
        }
    })
}
