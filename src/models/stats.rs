/// Point-in-time size of the detection engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// IPs with at least one bucket in the window.
    pub tracked_ips: usize,
    /// Buckets across all tracked IPs.
    pub buckets: usize,
    /// IPs currently on the blacklist.
    pub blacklisted: usize,
}
