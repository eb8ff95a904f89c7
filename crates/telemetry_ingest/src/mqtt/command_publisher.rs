use crate::mqtt::{command_topic, MqttConnectionConfig};
use async_trait::async_trait;
use common::domain::{CommandPublisher, DeviceCommand, DomainError, DomainResult};
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Publishes device commands on `{root}/{device_id}/command` with QoS 2
#[derive(Clone)]
pub struct MqttCommandPublisher {
    client: AsyncClient,
    topic_root: String,
}

/// Event loop driving the publisher's connection; must be polled for
/// commands to leave the process
pub struct MqttCommandConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConnectionConfig,
}

impl MqttCommandPublisher {
    pub fn new(config: MqttConnectionConfig, topic_root: impl Into<String>) -> DomainResult<(Self, MqttCommandConnection)> {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options()?, 100);
        let publisher = Self {
            client: client.clone(),
            topic_root: topic_root.into(),
        };
        let connection = MqttCommandConnection {
            client,
            eventloop,
            config,
        };
        Ok((publisher, connection))
    }
}

#[async_trait]
impl CommandPublisher for MqttCommandPublisher {
    #[instrument(skip(self, command, payload), fields(command_id = %command.command_id, device_id = %command.device_id))]
    async fn publish_command(&self, command: &DeviceCommand, payload: Vec<u8>) -> DomainResult<()> {
        let topic = command_topic(&self.topic_root, &command.device_id);
        self.client
            .publish(&topic, QoS::ExactlyOnce, false, payload)
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow::anyhow!("Failed to publish to {}: {}", topic, e))
            })?;
        debug!(topic = %topic, "command queued for broker");
        Ok(())
    }
}

impl MqttCommandConnection {
    /// Poll the connection until cancelled; rumqttc reconnects on the next
    /// poll after an error.
    #[instrument(name = "mqtt_command_connection", skip_all, fields(broker_url = %self.config.broker_url))]
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!("starting MQTT command connection");
        let mut failures = 0u32;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("shutdown signal received");
                    let _ = self.client.disconnect().await;
                    break;
                }
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            failures = 0;
                            info!("command connection established");
                        }
                        Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                            debug!(pkid = pubcomp.pkid, "command delivered to broker");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            failures += 1;
                            if self.config.retries_exhausted(failures) {
                                anyhow::bail!(
                                    "command connection to {} failed {} times: {}",
                                    self.config.broker_url,
                                    failures,
                                    e
                                );
                            }
                            warn!(error = %e, attempt = failures, "command connection error, reconnecting");
                            tokio::select! {
                                _ = ctx.cancelled() => break,
                                _ = tokio::time::sleep(self.config.retry_delay) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT command connection stopped");
        Ok(())
    }
}
