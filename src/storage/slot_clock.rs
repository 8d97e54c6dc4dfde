use std::fmt::Write;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::settings::DetectionConfig;

#[derive(Debug, Clone)]
struct SlotState {
    slot: DateTime<Utc>,
    label: String,
}

/// Shared "current slot" for ingestion.
///
/// Wall-clock time truncated to the configured timeslot (relative to the Unix
/// epoch), plus a human-readable label rendered with `timestamp_format`.
/// One writer (the `run` loop), many readers.
pub struct SlotClock {
    timeslot: Duration,
    format: String,
    state: RwLock<SlotState>,
}

impl SlotClock {
    pub fn new(config: &DetectionConfig) -> Self {
        let clock = Self {
            timeslot: config.timeslot(),
            format: config.timestamp_format.clone(),
            state: RwLock::new(SlotState {
                slot: DateTime::<Utc>::MIN_UTC,
                label: String::new(),
            }),
        };
        clock.refresh_at(Utc::now());
        clock
    }

    /// The slot new requests are counted in.
    pub fn current(&self) -> DateTime<Utc> {
        self.state.read().slot
    }

    pub fn label(&self) -> String {
        self.state.read().label.clone()
    }

    /// Truncate `at` down to a slot boundary.
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.timeslot.as_millis() as i64;
        if step <= 0 {
            return at;
        }
        let ms = at.timestamp_millis();
        DateTime::from_timestamp_millis(ms - ms.rem_euclid(step)).unwrap_or(at)
    }

    /// Recompute the current slot for wall-clock time `now`.
    pub fn refresh_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let slot = self.truncate(now);

        // Format is validated at startup; a bad one just yields a partial label.
        let mut label = String::new();
        let _ = write!(label, "{}", slot.format(&self.format));

        let mut state = self.state.write();
        if state.slot != slot {
            trace!(slot = %slot, label = %label, "Time slot advanced");
        }
        state.slot = slot;
        state.label = label;
        slot
    }

    /// Time left from `now` until the next slot boundary.
    pub fn until_next_slot(&self, now: DateTime<Utc>) -> Duration {
        let step = TimeDelta::from_std(self.timeslot).unwrap_or(TimeDelta::MAX);
        let next = self
            .truncate(now)
            .checked_add_signed(step)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (next - now).to_std().unwrap_or(self.timeslot)
    }

    /// Keep the slot aligned with wall-clock boundaries until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            self.refresh_at(now);
            let wait = self.until_next_slot(now);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Slot clock stopped");
    }
}
