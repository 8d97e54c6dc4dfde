use std::net::IpAddr;

use ipnet::IpNet;

use crate::models::request::normalize_ip;

/// Networks never attributed to an end client.
const PRIVATE_NETWORKS: &[&str] = &[
    "127.0.0.0/8",    // IPv4 loopback
    "10.0.0.0/8",     // RFC1918
    "172.16.0.0/12",  // RFC1918
    "192.168.0.0/16", // RFC1918
    "::1/128",        // IPv6 loopback
    "fe80::/10",      // IPv6 link-local
    "fc00::/7",       // IPv6 unique local
];

/// Static lookup table for loopback, RFC1918, link-local and unique-local ranges.
pub struct PrivateNetworks {
    networks: Vec<IpNet>,
}

impl PrivateNetworks {
    pub fn new() -> Self {
        let networks = PRIVATE_NETWORKS
            .iter()
            .filter_map(|cidr| cidr.parse::<IpNet>().ok())
            .collect();
        Self { networks }
    }

    pub fn is_private(&self, ip: &IpAddr) -> bool {
        self.network(ip).is_some()
    }

    /// The private network `ip` belongs to, if any.
    pub fn network(&self, ip: &IpAddr) -> Option<&IpNet> {
        let ip = normalize_ip(*ip);
        self.networks.iter().find(|net| net.contains(&ip))
    }
}

impl Default for PrivateNetworks {
    fn default() -> Self {
        Self::new()
    }
}
