use std::net::IpAddr;
use std::sync::Arc;

use tracing::trace;

use crate::config::settings::Settings;
use crate::models::request::Request;
use crate::models::stats::EngineStats;
use crate::models::verdict::Verdict;
use crate::protection::classifier::AssetClassifier;
use crate::protection::private_net::PrivateNetworks;
use crate::protocol::line::ParsedLine;
use crate::storage::blacklist::Blacklist;
use crate::storage::history::History;

/// Request-path entry point: turns one protocol line into ingested requests
/// and a verdict.
///
/// Holds no lock of its own. Each call touches the history and the blacklist
/// one after the other, never both at once.
pub struct Detector {
    history: Arc<History>,
    blacklist: Arc<Blacklist>,
    classifier: AssetClassifier,
    private_networks: PrivateNetworks,
    ignore_private_ips: bool,
}

impl Detector {
    pub fn new(history: Arc<History>, blacklist: Arc<Blacklist>, settings: &Settings) -> Self {
        Self {
            history,
            blacklist,
            classifier: AssetClassifier::new(),
            private_networks: PrivateNetworks::new(),
            ignore_private_ips: settings.filter.ignore_private_ips,
        }
    }

    /// Handle one `SOURCE_IP|FORWARDED_FOR_LIST|PATH` line.
    ///
    /// Malformed lines are let through untouched. Every remaining candidate
    /// IP is counted once; the line is blocked if any of them is blacklisted.
    pub fn handle_line(&self, line: &str) -> Verdict {
        trace!(line = %line, "Processing line");

        let Some(parsed) = ParsedLine::parse(line) else {
            trace!(line = %line, "Invalid input, letting it pass");
            return Verdict::Ok;
        };

        let candidates = self.candidates(&parsed);
        let path = parsed.path.unwrap_or_default();
        for ip in &candidates {
            self.record(&Request::new(*ip, path));
        }

        let verdict = self.check(&candidates);
        trace!(line = %line, verdict = %verdict, "Decision");
        verdict
    }

    /// Candidate IPs of a line after private-network filtering, deduplicated.
    pub fn candidates(&self, parsed: &ParsedLine<'_>) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = Vec::new();
        for ip in parsed.candidate_ips() {
            if self.ignore_private_ips && self.private_networks.is_private(&ip) {
                trace!(ip = %ip, "Ignoring private IP");
                continue;
            }
            if !ips.contains(&ip) {
                trace!(ip = %ip, "Adding candidate IP");
                ips.push(ip);
            }
        }
        ips
    }

    /// Classify a request and count it against its IP.
    pub fn record(&self, request: &Request) {
        let class = self.classifier.classify(&request.path);
        trace!(ip = %request.ip, class = %class, "Ingesting request");
        self.history.ingest(request.ip, class);
    }

    /// `Block` if any of `ips` is currently blacklisted.
    pub fn check(&self, ips: &[IpAddr]) -> Verdict {
        for (i, ip) in ips.iter().enumerate() {
            let blacklisted = self.blacklist.contains(ip);
            trace!(index = i, ip = %ip, blacklisted = blacklisted, "Blacklist lookup");
            if blacklisted {
                return Verdict::Block;
            }
        }
        Verdict::Ok
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tracked_ips: self.history.tracked_ips(),
            buckets: self.history.bucket_count(),
            blacklisted: self.blacklist.len(),
        }
    }
}
