use crate::domain::IngestMetrics;
use common::domain::{DomainError, DomainEvent, DomainEventPublisher, DomainResult, DurableSink, StoreRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Producer half of a bounded outbox; cheap to clone
pub struct OutboxSender<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for OutboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> OutboxSender<T> {
    /// Queue an item, waiting for room when the outbox is full
    pub async fn send(&self, item: T) -> DomainResult<()> {
        self.tx.send(item).await.map_err(|_| {
            DomainError::RepositoryError(anyhow::anyhow!("{} outbox is closed", self.name))
        })
    }
}

pub struct OutboxReceiver<T> {
    name: &'static str,
    rx: mpsc::Receiver<T>,
}

impl<T> OutboxReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an item if one is queued, without waiting
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Bounded queue decoupling the ingestion path from slow collaborators.
///
/// The receiving drain ends once every sender has been dropped and the
/// queue is empty.
pub fn outbox<T>(name: &'static str, capacity: usize) -> (OutboxSender<T>, OutboxReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboxSender { name, tx }, OutboxReceiver { name, rx })
}

/// Deliver queued records to the durable sink, then flush it
pub async fn run_sink_drain(
    mut outbox: OutboxReceiver<StoreRecord>,
    sink: Arc<dyn DurableSink>,
    metrics: Arc<IngestMetrics>,
) -> anyhow::Result<()> {
    info!(outbox = outbox.name, "sink drain started");

    while let Some(record) = outbox.recv().await {
        match sink.store(&record).await {
            Ok(()) => metrics.mark_stored(),
            Err(e) => {
                metrics.mark_sink_failure();
                error!(
                    device_id = %record.device_id,
                    message_type = %record.message_type,
                    error = %e,
                    "durable sink rejected record"
                );
            }
        }
    }

    debug!(outbox = outbox.name, "outbox closed, flushing sink");
    if let Err(e) = sink.flush().await {
        error!(error = %e, "failed to flush durable sink");
    }
    info!(outbox = outbox.name, "sink drain stopped");
    Ok(())
}

/// Deliver queued domain events to the event publisher
pub async fn run_event_drain(
    mut outbox: OutboxReceiver<DomainEvent>,
    publisher: Arc<dyn DomainEventPublisher>,
    metrics: Arc<IngestMetrics>,
) -> anyhow::Result<()> {
    info!(outbox = outbox.name, "event drain started");

    while let Some(event) = outbox.recv().await {
        match publisher.publish_event(&event).await {
            Ok(()) => metrics.mark_event_published(),
            Err(e) => {
                metrics.mark_event_publish_failure();
                warn!(event = event.kind(), error = %e, "failed to publish domain event");
            }
        }
    }

    info!(outbox = outbox.name, "event drain stopped");
    Ok(())
}
