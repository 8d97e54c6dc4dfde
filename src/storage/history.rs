use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::slot_clock::SlotClock;
use crate::models::request::{normalize_ip, RequestClass};

// ---------------------------------------------------------------------------
// Bucket / Series
// ---------------------------------------------------------------------------

/// Request counts for one IP within one time slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub slot: DateTime<Utc>,
    pub total: u64,
    pub app: u64,
    pub asset: u64,
}

impl Bucket {
    fn new(slot: DateTime<Utc>) -> Self {
        Self {
            slot,
            total: 0,
            app: 0,
            asset: 0,
        }
    }

    fn record(&mut self, class: RequestClass) {
        self.total += 1;
        match class {
            RequestClass::Application => self.app += 1,
            RequestClass::Asset => self.asset += 1,
        }
    }
}

/// Summed counts over the retained window of one IP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub total: u64,
    pub app: u64,
}

impl Totals {
    pub fn asset(&self) -> u64 {
        self.total - self.app
    }
}

/// Buckets of one IP, newest at the front, slots strictly decreasing.
#[derive(Debug, Default)]
struct Series {
    buckets: VecDeque<Bucket>,
}

impl Series {
    fn record(&mut self, slot: DateTime<Utc>, class: RequestClass) {
        match self.buckets.front_mut() {
            Some(head) if head.slot >= slot => {
                // A slot older than the head only shows up when the wall clock
                // steps backwards; fold it into the head to keep the ordering.
                head.record(class);
            }
            _ => {
                let mut bucket = Bucket::new(slot);
                bucket.record(class);
                self.buckets.push_front(bucket);
            }
        }
    }

    /// Drop buckets whose slot is at or before `cutoff`. Returns how many went.
    fn trim(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some(oldest) = self.buckets.back() {
            if oldest.slot > cutoff {
                break;
            }
            self.buckets.pop_back();
            removed += 1;
        }
        removed
    }

    fn totals(&self) -> Totals {
        self.buckets.iter().fold(Totals::default(), |acc, b| Totals {
            total: acc.total + b.total,
            app: acc.app + b.app,
        })
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Sliding-window request aggregator keyed by client IP.
///
/// Counts are kept per time slot and only for the configured window. The
/// series map and the set of IPs touched since the last decision pass are
/// guarded by separate locks, so marking an IP never contends with series
/// mutation.
pub struct History {
    clock: Arc<SlotClock>,
    window: TimeDelta,
    series: RwLock<HashMap<IpAddr, Series>>,
    touched: Mutex<HashSet<IpAddr>>,
}

impl History {
    pub fn new(clock: Arc<SlotClock>, window: Duration) -> Self {
        Self {
            clock,
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            series: RwLock::new(HashMap::new()),
            touched: Mutex::new(HashSet::new()),
        }
    }

    /// Count one request for `ip` in the current slot.
    pub fn ingest(&self, ip: IpAddr, class: RequestClass) {
        let ip = normalize_ip(ip);
        let slot = self.clock.current();

        self.touched.lock().insert(ip);

        let mut series = self.series.write();
        series.entry(ip).or_default().record(slot, class);
    }

    /// Oldest slot that is already outside the window at `now`.
    pub fn cutoff_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff_at(Utc::now())
    }

    /// Sum the retained counts for `ip`.
    ///
    /// This read mutates: buckets at or before `cutoff` are discarded on the
    /// way, and an IP left without buckets is removed entirely. It therefore
    /// takes the write lock. `None` means the IP has no requests in the window.
    pub fn totals(&self, ip: &IpAddr, cutoff: DateTime<Utc>) -> Option<Totals> {
        let ip = normalize_ip(*ip);
        let mut series = self.series.write();

        let entry = series.get_mut(&ip)?;
        entry.trim(cutoff);
        if entry.is_empty() {
            series.remove(&ip);
            return None;
        }
        Some(entry.totals())
    }

    /// Trim every series to the window and forget IPs with nothing left.
    /// Returns the number of IPs removed.
    pub fn sweep(&self, cutoff: DateTime<Utc>) -> usize {
        let mut series = self.series.write();
        let before = series.len();
        let mut buckets_removed = 0;

        series.retain(|_, s| {
            buckets_removed += s.trim(cutoff);
            !s.is_empty()
        });

        let ips_removed = before - series.len();
        if buckets_removed > 0 {
            debug!(
                cutoff = %cutoff,
                buckets_removed = buckets_removed,
                ips_removed = ips_removed,
                "Expired history buckets"
            );
        }
        ips_removed
    }

    /// Take the IPs that received requests since the previous call.
    pub fn drain_touched(&self) -> HashSet<IpAddr> {
        std::mem::take(&mut *self.touched.lock())
    }

    pub fn tracked_ips(&self) -> usize {
        self.series.read().len()
    }

    pub fn bucket_count(&self) -> usize {
        self.series.read().values().map(|s| s.buckets.len()).sum()
    }

    #[cfg(test)]
    pub fn buckets(&self, ip: &IpAddr) -> Option<Vec<Bucket>> {
        self.series
            .read()
            .get(ip)
            .map(|s| s.buckets.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::default_detection_config;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn setup(window_secs: u64) -> (Arc<SlotClock>, History) {
        let clock = Arc::new(SlotClock::new(&default_detection_config()));
        let history = History::new(clock.clone(), Duration::from_secs(window_secs));
        (clock, history)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_totals_within_one_slot() {
        let (clock, history) = setup(3600);
        clock.refresh_at(t(10, 0, 5));
        let addr = ip("198.51.100.7");

        for _ in 0..7 {
            history.ingest(addr, RequestClass::Application);
        }
        for _ in 0..3 {
            history.ingest(addr, RequestClass::Asset);
        }

        let totals = history.totals(&addr, DateTime::<Utc>::MIN_UTC).unwrap();
        assert_eq!(totals, Totals { total: 10, app: 7 });
        assert_eq!(totals.asset(), 3);

        let buckets = history.buckets(&addr).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].total, buckets[0].app + buckets[0].asset);
    }

    #[test]
    fn test_new_slot_prepends_bucket() {
        let (clock, history) = setup(3600);
        let addr = ip("198.51.100.7");

        clock.refresh_at(t(10, 0, 0));
        history.ingest(addr, RequestClass::Application);
        clock.refresh_at(t(10, 1, 30));
        history.ingest(addr, RequestClass::Asset);
        history.ingest(addr, RequestClass::Asset);
        clock.refresh_at(t(10, 2, 0));
        history.ingest(addr, RequestClass::Application);

        let buckets = history.buckets(&addr).unwrap();
        let slots: Vec<_> = buckets.iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![t(10, 2, 0), t(10, 1, 0), t(10, 0, 0)]);
        assert_eq!(buckets[1].asset, 2);
        assert_eq!(history.bucket_count(), 3);
    }

    #[test]
    fn test_backwards_clock_keeps_order() {
        let (clock, history) = setup(3600);
        let addr = ip("198.51.100.7");

        clock.refresh_at(t(10, 5, 0));
        history.ingest(addr, RequestClass::Application);
        clock.refresh_at(t(10, 4, 0));
        history.ingest(addr, RequestClass::Application);

        let buckets = history.buckets(&addr).unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].slot, t(10, 5, 0));
        assert_eq!(buckets[0].app, 2);
    }

    #[test]
    fn test_totals_discards_expired_buckets() {
        let (clock, history) = setup(600);
        let addr = ip("198.51.100.7");

        clock.refresh_at(t(10, 0, 0));
        for _ in 0..5 {
            history.ingest(addr, RequestClass::Application);
        }
        clock.refresh_at(t(10, 8, 0));
        history.ingest(addr, RequestClass::Asset);

        // 10:11 - 10 min = 10:01, so the 10:00 bucket is gone.
        let cutoff = history.cutoff_at(t(10, 11, 0));
        assert_eq!(
            history.totals(&addr, cutoff),
            Some(Totals { total: 1, app: 0 })
        );
        assert_eq!(history.buckets(&addr).unwrap().len(), 1);
    }

    #[test]
    fn test_bucket_at_cutoff_is_expired() {
        let (clock, history) = setup(600);
        let addr = ip("198.51.100.7");

        clock.refresh_at(t(10, 0, 0));
        history.ingest(addr, RequestClass::Application);

        assert_eq!(history.totals(&addr, t(10, 0, 0)), None);
        assert_eq!(history.tracked_ips(), 0);
    }

    #[test]
    fn test_totals_removes_emptied_ip() {
        let (clock, history) = setup(600);
        let addr = ip("198.51.100.7");

        clock.refresh_at(t(10, 0, 0));
        history.ingest(addr, RequestClass::Application);
        assert_eq!(history.tracked_ips(), 1);

        let cutoff = history.cutoff_at(t(11, 0, 0));
        assert_eq!(history.totals(&addr, cutoff), None);
        assert_eq!(history.tracked_ips(), 0);
        assert!(history.buckets(&addr).is_none());
    }

    #[test]
    fn test_totals_unknown_ip() {
        let (_, history) = setup(600);
        assert_eq!(history.totals(&ip("192.0.2.1"), DateTime::<Utc>::MIN_UTC), None);
    }

    #[test]
    fn test_sweep_trims_and_deletes() {
        let (clock, history) = setup(600);
        let old = ip("192.0.2.1");
        let mixed = ip("192.0.2.2");
        let fresh = ip("2001:db8::2");

        clock.refresh_at(t(10, 0, 0));
        history.ingest(old, RequestClass::Application);
        history.ingest(mixed, RequestClass::Application);
        clock.refresh_at(t(10, 9, 0));
        history.ingest(mixed, RequestClass::Asset);
        history.ingest(fresh, RequestClass::Asset);

        let removed = history.sweep(history.cutoff_at(t(10, 10, 30)));
        assert_eq!(removed, 1);
        assert_eq!(history.tracked_ips(), 2);
        assert_eq!(history.bucket_count(), 2);
        assert!(history.buckets(&old).is_none());
        assert_eq!(history.buckets(&mixed).unwrap()[0].slot, t(10, 9, 0));
    }

    #[test]
    fn test_drain_touched_clears() {
        let (_, history) = setup(600);
        history.ingest(ip("192.0.2.1"), RequestClass::Application);
        history.ingest(ip("192.0.2.1"), RequestClass::Asset);
        history.ingest(ip("192.0.2.2"), RequestClass::Asset);

        let touched = history.drain_touched();
        assert_eq!(touched.len(), 2);
        assert!(touched.contains(&ip("192.0.2.1")));
        assert!(history.drain_touched().is_empty());
    }

    #[test]
    fn test_mapped_v4_shares_series() {
        let (_, history) = setup(600);
        history.ingest(ip("::ffff:192.0.2.9"), RequestClass::Application);
        history.ingest(ip("192.0.2.9"), RequestClass::Application);

        assert_eq!(history.tracked_ips(), 1);
        assert_eq!(
            history.totals(&ip("192.0.2.9"), DateTime::<Utc>::MIN_UTC),
            Some(Totals { total: 2, app: 2 })
        );
    }

    #[test]
    fn test_concurrent_ingest() {
        let (_, history) = setup(3600);
        let history = Arc::new(history);
        let addr = ip("203.0.113.77");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let history = history.clone();
                std::thread::spawn(move || {
                    let class = if i % 2 == 0 {
                        RequestClass::Application
                    } else {
                        RequestClass::Asset
                    };
                    for _ in 0..500 {
                        history.ingest(addr, class);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let totals = history.totals(&addr, DateTime::<Utc>::MIN_UTC).unwrap();
        assert_eq!(totals, Totals { total: 4000, app: 2000 });
    }
}
