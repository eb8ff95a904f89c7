use crate::nats::trace_context::inject_trace_context;
use crate::nats::traits::JetStreamPublisher;
use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream::Config as StreamConfig};
use async_nats::HeaderMap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Connection to the NATS server, shared by the JetStream sinks and the
/// command request listener
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {}", url))?;
        let jetstream = jetstream::new(client.clone());

        info!(url = %url, "connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Create the stream unless it already exists. The stream captures every
    /// subject below its own name (`{name}.>`).
    pub async fn ensure_stream(&self, name: &str, description: &str) -> Result<()> {
        if self.jetstream.get_stream(name).await.is_ok() {
            info!(stream = %name, "stream already exists");
            return Ok(());
        }

        self.jetstream
            .create_stream(StreamConfig {
                name: name.to_string(),
                subjects: vec![format!("{}.>", name)],
                description: Some(description.to_string()),
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to create stream {}", name))?;
        info!(stream = %name, "created stream");
        Ok(())
    }

    /// Core (non-JetStream) client for request/reply subscriptions
    pub fn client(&self) -> async_nats::Client {
        self.client.clone()
    }

    pub fn create_publisher_client(&self) -> Arc<dyn JetStreamPublisher> {
        Arc::new(NatsJetStreamPublisher::new(self.jetstream.clone()))
    }

    pub async fn close(&self) -> Result<()> {
        info!("draining NATS connection");
        self.client
            .drain()
            .await
            .context("failed to drain NATS connection")?;
        Ok(())
    }
}

pub struct NatsJetStreamPublisher {
    context: jetstream::Context,
}

impl NatsJetStreamPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl JetStreamPublisher for NatsJetStreamPublisher {
    #[instrument(skip(self, payload), fields(subject = %subject, payload_size = payload.len()))]
    async fn publish(&self, subject: String, payload: bytes::Bytes) -> Result<()> {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);

        let ack = self
            .context
            .publish_with_headers(subject, headers, payload)
            .await
            .context("failed to publish to JetStream")?;
        ack.await.context("JetStream did not acknowledge publish")?;
        Ok(())
    }
}
