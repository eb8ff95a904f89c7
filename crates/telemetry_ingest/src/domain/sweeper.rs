use crate::domain::{IngestState, OutboxSender};
use chrono::{DateTime, Utc};
use common::domain::DomainEvent;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic liveness timeout sweep, plus idle eviction of per-device state
pub struct LivenessSweeper {
    state: IngestState,
    events: OutboxSender<DomainEvent>,
    interval: Duration,
}

impl LivenessSweeper {
    pub fn new(state: IngestState, events: OutboxSender<DomainEvent>, interval: Duration) -> Self {
        Self {
            state,
            events,
            interval,
        }
    }

    /// Run one sweep at `now` and return the number of devices marked offline
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let offline = self.state.liveness.sweep(now);
        let count = offline.len();
        publish_all(&self.events, offline).await;

        let evicted = self.state.tracker.evict_idle(now)
            + self.state.liveness.evict_idle(now)
            + self.state.ota.evict_idle(now);
        if evicted > 0 {
            debug!(evicted, "evicted idle device state");
        }

        debug!(
            online = self.state.liveness.online_count(),
            tracked = self.state.tracker.tracked_devices(),
            metrics = ?self.state.metrics.snapshot(),
            "liveness sweep finished"
        );
        count
    }

    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "liveness sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }

        info!(metrics = ?self.state.metrics.snapshot(), "liveness sweeper stopped");
        Ok(())
    }
}

/// Periodic command timeout and OTA stall sweep
pub struct CommandSweeper {
    state: IngestState,
    events: OutboxSender<DomainEvent>,
    interval: Duration,
}

impl CommandSweeper {
    pub fn new(state: IngestState, events: OutboxSender<DomainEvent>, interval: Duration) -> Self {
        Self {
            state,
            events,
            interval,
        }
    }

    /// Run one sweep at `now` and return the number of events raised
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let mut events = self.state.correlator.sweep(now);
        events.extend(self.state.ota.sweep_stalled(now));
        let count = events.len();
        publish_all(&self.events, events).await;

        debug!(pending = self.state.correlator.pending_count(), "command sweep finished");
        count
    }

    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "command sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }

        info!("command sweeper stopped");
        Ok(())
    }
}

async fn publish_all(outbox: &OutboxSender<DomainEvent>, events: Vec<DomainEvent>) {
    for event in events {
        let kind = event.kind();
        if let Err(e) = outbox.send(event).await {
            warn!(event = kind, error = %e, "dropping event raised by sweep");
        }
    }
}
