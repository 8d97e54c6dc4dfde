use std::fmt;
use std::net::IpAddr;

/// Kind of resource a request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// HTML/API-like request: anything that is not an asset.
    Application,
    /// Static asset: image, stylesheet, script, icon.
    Asset,
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestClass::Application => write!(f, "application"),
            RequestClass::Asset => write!(f, "asset"),
        }
    }
}

/// One observed HTTP request, as handed over by the line protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ip: IpAddr,
    pub path: String,
}

impl Request {
    pub fn new(ip: IpAddr, path: impl Into<String>) -> Self {
        Self {
            ip: normalize_ip(ip),
            path: path.into(),
        }
    }
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) into plain IPv4 so the
/// same client always maps to the same key.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}
