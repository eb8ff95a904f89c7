use crate::domain::BoundedTable;
use chrono::{DateTime, Utc};
use common::domain::DomainResult;
use std::collections::BTreeSet;

const HALF_SEQUENCE_SPACE: u32 = 1 << 31;

/// Outcome of checking a sequence number against a device's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Duplicate,
    /// New message that revealed missing sequences. Bounds are inclusive
    /// device sequence numbers and may straddle the 2^32 wrap.
    Gap { missing_from: u32, missing_to: u32 },
}

impl Classification {
    pub fn is_new_data(&self) -> bool {
        !matches!(self, Classification::Duplicate)
    }
}

/// Per-device dedup state.
///
/// Sequences are tracked in an unwrapped 64-bit space: each incoming `u32`
/// is placed at the position closest ahead of the contiguous run, so a wrap
/// from `u32::MAX` to `0` is simply the next position.
struct DedupState {
    highest_contiguous: Option<u64>,
    highest_seen: u64,
    window: BTreeSet<u64>,
    session_announced_at: Option<DateTime<Utc>>,
    /// Set by an `online` announcement; resolved by the next sequence that
    /// either continues the run or falls far behind it
    restart_pending: bool,
}

impl DedupState {
    fn empty() -> Self {
        Self {
            highest_contiguous: None,
            highest_seen: 0,
            window: BTreeSet::new(),
            session_announced_at: None,
            restart_pending: false,
        }
    }

    fn baseline(&mut self, sequence: u32) {
        self.highest_contiguous = Some(u64::from(sequence));
        self.highest_seen = u64::from(sequence);
        self.window.clear();
        self.restart_pending = false;
    }

    fn classify(&mut self, sequence: u32, window_size: usize) -> Classification {
        let Some(contiguous) = self.highest_contiguous else {
            // Baseline: history before the first observed message is unknown
            self.baseline(sequence);
            return Classification::New;
        };

        let expected = contiguous + 1;
        let distance = sequence.wrapping_sub(expected as u32);
        if distance >= HALF_SEQUENCE_SPACE {
            let behind = (expected as u32).wrapping_sub(sequence);
            if self.restart_pending && behind as usize > window_size {
                self.baseline(sequence);
                return Classification::New;
            }
            return Classification::Duplicate;
        }
        let position = expected + u64::from(distance);
        // The device kept counting, so the announcement was a reconnect
        self.restart_pending = false;

        if position == expected {
            self.highest_contiguous = Some(position);
            self.highest_seen = self.highest_seen.max(position);
            self.absorb_window();
            return Classification::New;
        }

        if !self.window.insert(position) {
            return Classification::Duplicate;
        }

        let classification = if position > self.highest_seen + 1 {
            Classification::Gap {
                missing_from: (self.highest_seen + 1) as u32,
                missing_to: (position - 1) as u32,
            }
        } else {
            Classification::New
        };
        self.highest_seen = self.highest_seen.max(position);

        while self.window.len() > window_size {
            // The oldest out-of-order entry falls out: everything below it
            // is given up as permanently missing.
            if let Some(oldest) = self.window.pop_first() {
                self.highest_contiguous = Some(oldest);
                self.absorb_window();
            }
        }

        classification
    }

    fn absorb_window(&mut self) {
        let Some(mut contiguous) = self.highest_contiguous else {
            return;
        };
        while let Some(&first) = self.window.first() {
            if first > contiguous + 1 {
                break;
            }
            self.window.pop_first();
            contiguous = contiguous.max(first);
        }
        self.highest_contiguous = Some(contiguous);
    }
}

/// Sequence deduplication and gap detection for every device
pub struct SequenceTracker {
    devices: BoundedTable<String, DedupState>,
    window_size: usize,
}

impl SequenceTracker {
    pub fn new(window_size: usize, capacity: usize, idle_ttl: chrono::Duration) -> Self {
        Self {
            devices: BoundedTable::new("dedup", capacity, idle_ttl),
            window_size: window_size.max(1),
        }
    }

    /// Classify a message; `None` marks a dedup-ineligible message, which is
    /// always new and leaves the device's state untouched.
    ///
    /// The first sequence seen from a device is a baseline and classifies
    /// `New` rather than `Gap(0, n - 1)`: after an engine restart or idle
    /// eviction the earlier history is unknown, not missing.
    pub fn classify(
        &self,
        device_id: &str,
        sequence: Option<u32>,
        now: DateTime<Utc>,
    ) -> DomainResult<Classification> {
        let Some(sequence) = sequence else {
            return Ok(Classification::New);
        };
        let window_size = self.window_size;
        self.devices.upsert(
            device_id.to_string(),
            now,
            DedupState::empty,
            |state| state.classify(sequence, window_size),
        )
    }

    /// Highest sequence with nothing missing below it, `-1` if none seen
    pub fn highest_contiguous_seq(&self, device_id: &str) -> i64 {
        self.devices
            .read(&device_id.to_string(), |state| {
                state
                    .highest_contiguous
                    .map(|position| i64::from(position as u32))
            })
            .flatten()
            .unwrap_or(-1)
    }

    /// Record an `online` announcement as a possible restart.
    ///
    /// Firmware announces on every reconnect, so the history is kept: a
    /// sequence near the run is still a duplicate. Only a sequence further
    /// behind the run than the recent window starts a new baseline. An
    /// announcement no newer than the last one recorded (a retained status
    /// replayed by a broker) is ignored.
    pub fn announce_session(
        &self,
        device_id: &str,
        announced_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        self.devices.upsert(
            device_id.to_string(),
            now,
            DedupState::empty,
            |state| {
                if state
                    .session_announced_at
                    .is_some_and(|previous| previous >= announced_at)
                {
                    return false;
                }
                state.session_announced_at = Some(announced_at);
                state.restart_pending = state.highest_contiguous.is_some();
                true
            },
        )
    }

    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        self.devices.evict_idle(now)
    }

    pub fn tracked_devices(&self) -> usize {
        self.devices.len()
    }
}
