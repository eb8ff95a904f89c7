use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters for the ingestion pipeline
#[derive(Default)]
pub struct IngestMetrics {
    messages_received: AtomicU64,
    decode_failures: AtomicU64,
    new_messages: AtomicU64,
    duplicates_dropped: AtomicU64,
    gaps_detected: AtomicU64,
    records_stored: AtomicU64,
    sink_failures: AtomicU64,
    stale_acks: AtomicU64,
    ota_reports_rejected: AtomicU64,
    events_published: AtomicU64,
    event_publish_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestMetricsSnapshot {
    pub messages_received: u64,
    pub decode_failures: u64,
    pub new_messages: u64,
    pub duplicates_dropped: u64,
    pub gaps_detected: u64,
    pub records_stored: u64,
    pub sink_failures: u64,
    pub stale_acks: u64,
    pub ota_reports_rejected: u64,
    pub events_published: u64,
    pub event_publish_failures: u64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_received(&self) {
        self.messages_received.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_new(&self) {
        self.new_messages.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_gap(&self) {
        self.gaps_detected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_stored(&self) {
        self.records_stored.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_stale_ack(&self) {
        self.stale_acks.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_ota_report_rejected(&self) {
        self.ota_reports_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_event_published(&self) {
        self.events_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_event_publish_failure(&self) {
        self.event_publish_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> IngestMetricsSnapshot {
        IngestMetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::SeqCst),
            decode_failures: self.decode_failures.load(Ordering::SeqCst),
            new_messages: self.new_messages.load(Ordering::SeqCst),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::SeqCst),
            gaps_detected: self.gaps_detected.load(Ordering::SeqCst),
            records_stored: self.records_stored.load(Ordering::SeqCst),
            sink_failures: self.sink_failures.load(Ordering::SeqCst),
            stale_acks: self.stale_acks.load(Ordering::SeqCst),
            ota_reports_rejected: self.ota_reports_rejected.load(Ordering::SeqCst),
            events_published: self.events_published.load(Ordering::SeqCst),
            event_publish_failures: self.event_publish_failures.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = IngestMetrics::new();
        metrics.mark_received();
        metrics.mark_received();
        metrics.mark_duplicate();
        metrics.mark_gap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.duplicates_dropped, 1);
        assert_eq!(snapshot.gaps_detected, 1);
        assert_eq!(snapshot.records_stored, 0);
    }
}
