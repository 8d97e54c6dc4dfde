use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protection::detector::Detector;

/// Periodically logs how much state the engine is holding.
pub struct StatsReporter {
    detector: Arc<Detector>,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(detector: Arc<Detector>, interval: Duration) -> Self {
        Self { detector, interval }
    }

    /// Run the reporter loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.report(),
            }
        }
        debug!("Stats reporter stopped");
    }

    fn report(&self) {
        let stats = self.detector.stats();
        info!(
            tracked_ips = stats.tracked_ips,
            buckets = stats.buckets,
            blacklisted = stats.blacklisted,
            "Engine stats"
        );
    }
}
