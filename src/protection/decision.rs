use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::settings::DetectionConfig;
use crate::storage::blacklist::Blacklist;
use crate::storage::history::{History, Totals};

/// Block heuristic: more than `max_requests` application requests and a
/// total/application ratio above `max_ratio`.
///
/// `total` includes the application requests, so the ratio is never below 1;
/// with the default `max_ratio` of 0.85 the second clause always holds.
pub fn should_block(totals: Totals, max_requests: u64, max_ratio: f64) -> bool {
    if totals.app == 0 {
        return false;
    }
    let ratio = totals.total as f64 / totals.app as f64;
    totals.app > max_requests && ratio > max_ratio
}

/// Outcome of one decision pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecisionReport {
    /// IPs with activity since the previous pass.
    pub evaluated: usize,
    /// Touched IPs that had no requests left in the window.
    pub skipped: usize,
    /// IPs newly added to the blacklist.
    pub blocked: usize,
}

/// Periodically turns aggregated counts into blacklist entries.
///
/// Only IPs touched since the previous pass are evaluated. The history lock is
/// taken per IP and released before the blacklist is consulted.
pub struct DecisionLoop {
    history: Arc<History>,
    blacklist: Arc<Blacklist>,
    interval: Duration,
    max_requests: u64,
    max_ratio: f64,
}

impl DecisionLoop {
    pub fn new(history: Arc<History>, blacklist: Arc<Blacklist>, config: &DetectionConfig) -> Self {
        if config.max_ratio < 1.0 {
            warn!(
                max_ratio = config.max_ratio,
                "max_ratio is below 1.0; total/app is never below 1, so only max_requests decides"
            );
        }
        info!(
            interval_ms = config.decision_interval_ms,
            max_requests = config.max_requests,
            max_ratio = config.max_ratio,
            "Decision loop configured"
        );
        Self {
            history,
            blacklist,
            interval: config.decision_interval(),
            max_requests: config.max_requests,
            max_ratio: config.max_ratio,
        }
    }

    /// Evaluate every touched IP once.
    pub fn run_once(&self) -> DecisionReport {
        self.run_once_at(Utc::now())
    }

    pub fn run_once_at(&self, now: DateTime<Utc>) -> DecisionReport {
        let cutoff = self.history.cutoff_at(now);
        let touched = self.history.drain_touched();
        let mut report = DecisionReport {
            evaluated: touched.len(),
            ..Default::default()
        };

        for ip in touched {
            let Some(totals) = self.history.totals(&ip, cutoff) else {
                report.skipped += 1;
                continue;
            };

            let block = should_block(totals, self.max_requests, self.max_ratio);
            trace!(
                ip = %ip,
                total = totals.total,
                app = totals.app,
                asset = totals.asset(),
                block = block,
                "Evaluated IP"
            );

            if block && self.blacklist.insert_if_absent(ip) {
                info!(
                    ip = %ip,
                    total = totals.total,
                    app = totals.app,
                    "IP blacklisted"
                );
                report.blocked += 1;
            }
        }

        if report.evaluated > 0 {
            debug!(
                evaluated = report.evaluated,
                skipped = report.skipped,
                blocked = report.blocked,
                "Decision pass complete"
            );
        }
        report
    }

    /// Run a pass every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_once();
                }
            }
        }
        debug!("Decision loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_detection_config;
    use crate::models::request::RequestClass;
    use crate::storage::slot_clock::SlotClock;
    use chrono::TimeZone;
    use std::net::IpAddr;

    struct Fixture {
        clock: Arc<SlotClock>,
        history: Arc<History>,
        blacklist: Arc<Blacklist>,
        decision: DecisionLoop,
    }

    fn fixture() -> Fixture {
        let config = default_detection_config();
        let clock = Arc::new(SlotClock::new(&config));
        let history = Arc::new(History::new(clock.clone(), config.window()));
        let blacklist = Arc::new(Blacklist::new(config.blacklist_ttl()));
        let decision = DecisionLoop::new(history.clone(), blacklist.clone(), &config);
        Fixture {
            clock,
            history,
            blacklist,
            decision,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn feed(history: &History, addr: IpAddr, app: u64, asset: u64) {
        for _ in 0..app {
            history.ingest(addr, RequestClass::Application);
        }
        for _ in 0..asset {
            history.ingest(addr, RequestClass::Asset);
        }
    }

    #[test]
    fn test_should_block_heuristic() {
        assert!(should_block(Totals { total: 42, app: 40 }, 30, 0.85));
        assert!(!should_block(Totals { total: 60, app: 10 }, 30, 0.85));
        assert!(!should_block(Totals { total: 30, app: 30 }, 30, 0.85));
        assert!(!should_block(Totals { total: 50, app: 0 }, 0, 0.85));
        // Ratio clause with a threshold above 1.
        assert!(!should_block(Totals { total: 42, app: 40 }, 30, 1.5));
        assert!(should_block(Totals { total: 80, app: 40 }, 30, 1.5));
    }

    #[test]
    fn test_html_heavy_ip_is_blocked() {
        let f = fixture();
        let addr = ip("203.0.113.5");
        feed(&f.history, addr, 40, 2);

        let report = f.decision.run_once();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.blocked, 1);
        assert!(f.blacklist.contains(&addr));
    }

    #[test]
    fn test_asset_heavy_ip_is_allowed() {
        let f = fixture();
        let addr = ip("203.0.113.9");
        feed(&f.history, addr, 10, 50);

        let report = f.decision.run_once();
        assert_eq!(report.blocked, 0);
        assert!(!f.blacklist.contains(&addr));
    }

    #[test]
    fn test_untouched_ips_are_not_reevaluated() {
        let f = fixture();
        let addr = ip("203.0.113.5");
        feed(&f.history, addr, 40, 0);
        assert_eq!(f.decision.run_once().blocked, 1);

        let report = f.decision.run_once();
        assert_eq!(report, DecisionReport::default());
        // Already blocked: a re-flag does not count as a new block.
        feed(&f.history, addr, 1, 0);
        assert_eq!(f.decision.run_once().blocked, 0);
    }

    #[test]
    fn test_expired_activity_is_skipped() {
        let f = fixture();
        let addr = ip("198.51.100.1");
        f.clock
            .refresh_at(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        feed(&f.history, addr, 100, 0);

        let later = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let report = f.decision.run_once_at(later);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.blocked, 0);
        assert_eq!(f.history.tracked_ips(), 0);
    }

    #[test]
    fn test_counts_accumulate_across_slots() {
        let f = fixture();
        let addr = ip("198.51.100.2");
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        f.clock.refresh_at(base);
        feed(&f.history, addr, 20, 0);
        assert_eq!(f.decision.run_once_at(base).blocked, 0);

        f.clock.refresh_at(base + chrono::TimeDelta::minutes(5));
        feed(&f.history, addr, 20, 1);
        let report = f.decision.run_once_at(base + chrono::TimeDelta::minutes(5));
        assert_eq!(report.blocked, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), f.decision.run(cancel))
            .await
            .expect("decision loop should exit once cancelled");
    }
}
