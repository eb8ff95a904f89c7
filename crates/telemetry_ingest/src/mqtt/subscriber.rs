use crate::domain::{IngestionRouter, RouteOutcome};
use crate::mqtt::{subscription_filters, MqttConnectionConfig};
use chrono::Utc;
use common::domain::{DomainError, DomainResult};
use rumqttc::{AsyncClient, Event, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument, Span};

/// Run the MQTT subscription for one broker.
///
/// Subscribes to every inbound device topic under `topic_root` and feeds
/// each message to the shared ingestion router. Connection failures are
/// retried; a fatal routing error stops the subscriber with an error.
#[instrument(
    name = "mqtt_subscriber",
    skip_all,
    fields(broker_url = %config.broker_url, client_id = %config.client_id)
)]
pub async fn run_mqtt_subscriber(
    config: MqttConnectionConfig,
    topic_root: String,
    router: IngestionRouter,
    ctx: CancellationToken,
) -> anyhow::Result<()> {
    info!("starting MQTT subscriber");

    let mut retry_count = 0;

    loop {
        if ctx.is_cancelled() {
            debug!("MQTT subscriber cancelled before connection");
            break;
        }

        match run_mqtt_connection(&config, &topic_root, &router, &ctx).await {
            Ok(()) => {
                debug!("MQTT subscriber stopped cleanly");
                break;
            }
            Err(e) if e.is_fatal() || matches!(e, DomainError::InvalidConfiguration(_)) => {
                error!(error = %e, "MQTT subscriber cannot continue");
                return Err(e.into());
            }
            Err(e) => {
                error!(error = %e, "MQTT connection error");

                retry_count += 1;
                if config.retries_exhausted(retry_count) {
                    error!(
                        max_retries = config.max_retry_attempts,
                        "max retry attempts reached, stopping MQTT subscriber"
                    );
                    anyhow::bail!(
                        "gave up on broker {} after {} attempts",
                        config.broker_url,
                        retry_count
                    );
                }

                warn!(attempt = retry_count, "retrying MQTT connection");

                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }

    info!("MQTT subscriber stopped");
    Ok(())
}

/// Run a single MQTT connection session
#[instrument(name = "mqtt_connection", skip_all)]
async fn run_mqtt_connection(
    config: &MqttConnectionConfig,
    topic_root: &str,
    router: &IngestionRouter,
    ctx: &CancellationToken,
) -> DomainResult<()> {
    let (client, mut eventloop) = AsyncClient::new(config.mqtt_options()?, 100);

    for filter in subscription_filters(topic_root) {
        client
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                DomainError::RepositoryError(anyhow::anyhow!("Failed to subscribe to {}: {}", filter, e))
            })?;
        debug!(topic = %filter, "subscription requested");
    }

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("shutdown signal received");
                let _ = client.disconnect().await;
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_mqtt_message(
                            router,
                            &config.broker_url,
                            &publish.topic,
                            &publish.payload,
                        )
                        .await?;
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(DomainError::RepositoryError(
                            anyhow::anyhow!("MQTT event loop error: {}", e),
                        ));
                    }
                }
            }
        }
    }
}

/// Route one inbound message under its own root span.
///
/// The span is not nested under the subscriber span, so every message is
/// an independent trace. Only fatal errors are returned.
pub(crate) async fn handle_mqtt_message(
    router: &IngestionRouter,
    broker_url: &str,
    topic: &str,
    payload: &[u8],
) -> DomainResult<RouteOutcome> {
    let span = info_span!(
        parent: Span::none(),
        "mqtt_message",
        broker_url = %broker_url,
        topic = %topic,
        payload_size = payload.len(),
    );

    router
        .route(topic, payload, Utc::now())
        .instrument(span)
        .await
}
