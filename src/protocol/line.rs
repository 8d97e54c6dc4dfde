use std::net::IpAddr;

use crate::models::request::normalize_ip;

/// One input line split into its fields: `SOURCE_IP|FORWARDED_FOR_LIST|PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub remote: &'a str,
    pub forwarded_for: &'a str,
    pub path: Option<&'a str>,
}

impl<'a> ParsedLine<'a> {
    /// Split a line. Fewer than two `|`-separated fields yields `None`.
    /// Anything after the second `|` is the path, pipes included.
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut fields = line.splitn(3, '|');
        let remote = fields.next()?;
        let forwarded_for = fields.next()?;
        let path = fields.next().filter(|p| !p.is_empty());
        Some(Self {
            remote,
            forwarded_for,
            path,
        })
    }

    /// Source IP followed by every forwarded-for entry that parses.
    /// Unparsable entries are dropped; order is preserved, duplicates are not removed.
    pub fn candidate_ips(&self) -> impl Iterator<Item = IpAddr> + 'a {
        std::iter::once(self.remote)
            .chain(self.forwarded_for.split(','))
            .filter_map(parse_ip)
    }
}

/// Parse one textual address, tolerating surrounding whitespace.
pub fn parse_ip(s: &str) -> Option<IpAddr> {
    s.trim().parse::<IpAddr>().ok().map(normalize_ip)
}
