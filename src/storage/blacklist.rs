use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::models::request::normalize_ip;

/// Short-lived set of blocked IPs.
///
/// Membership lives in a `DashMap` so lookups on the request path only touch
/// one shard. Expiry order is kept separately in an insertion-ordered queue;
/// with a fixed TTL that is also expiry order, so a sweep stops at the first
/// live entry.
pub struct Blacklist {
    ttl: Duration,
    entries: DashMap<IpAddr, Instant>,
    expiry: Mutex<VecDeque<(IpAddr, Instant)>>,
}

impl Blacklist {
    pub fn new(ttl: Duration) -> Self {
        info!(ttl_secs = ttl.as_secs(), "Blacklist initialised");
        Self {
            ttl,
            entries: DashMap::with_capacity(1_024),
            expiry: Mutex::new(VecDeque::new()),
        }
    }

    /// Block `ip` for one TTL unless it is already blocked.
    /// An existing entry keeps its original expiry. Returns true on insert.
    pub fn insert_if_absent(&self, ip: IpAddr) -> bool {
        self.insert_if_absent_at(ip, Instant::now())
    }

    pub fn insert_if_absent_at(&self, ip: IpAddr, now: Instant) -> bool {
        let ip = normalize_ip(ip);
        let expires_at = now + self.ttl;

        match self.entries.entry(ip) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
            }
        }

        // Shard lock is released above; never hold both.
        self.expiry.lock().push_back((ip, expires_at));
        true
    }

    /// Whether `ip` is on the blacklist right now. Never evicts.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.contains_key(&normalize_ip(*ip))
    }

    /// Remove every entry whose expiry has passed. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<(IpAddr, Instant)> = {
            let mut queue = self.expiry.lock();
            let mut out = Vec::new();
            while let Some(&(_, expires_at)) = queue.front() {
                if expires_at > now {
                    break;
                }
                if let Some(item) = queue.pop_front() {
                    out.push(item);
                }
            }
            out
        };

        let mut removed = 0;
        for (ip, expires_at) in &expired {
            // Only drop the entry this queue item was created for.
            if self
                .entries
                .remove_if(ip, |_, current| current == expires_at)
                .is_some()
            {
                debug!(ip = %ip, "Blacklist entry expired");
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn expires_at(&self, ip: &IpAddr) -> Option<Instant> {
        self.entries.get(ip).map(|e| *e.value())
    }
}
