//! Requester network data and location lookups.
//!
//! Host entries in restrictions are IP addresses, CIDR networks, hostnames
//! or wildcard hostnames (`*.example.org`). Address containment is decided
//! with [`IpNetwork`]; hostnames are matched against the reverse-DNS name of
//! the requesting address.

use ipnetwork::IpNetwork;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Placeholder in a host list that is replaced by the requester's address.
pub const THIS_IP_PLACEHOLDER: &str = "this";

/// Metadata about the client performing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub ip: IpAddr,
    #[serde(default)]
    pub user_agent: String,
}

impl ClientMetadata {
    pub fn new(ip: IpAddr, user_agent: impl Into<String>) -> Self {
        Self {
            ip,
            user_agent: user_agent.into(),
        }
    }
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            user_agent: String::new(),
        }
    }
}

/// Resolves an address to an ISO country code.
pub trait GeoIp: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

/// Resolves an address to its hostname.
pub trait ReverseDns: Send + Sync {
    fn hostname(&self, ip: IpAddr) -> Option<String>;
}

/// GeoIP lookup that knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeoIp;

impl GeoIp for NoGeoIp {
    fn country_code(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// Reverse DNS that never resolves.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReverseDns;

impl ReverseDns for NoReverseDns {
    fn hostname(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// GeoIP lookup from a fixed network → country table. First match wins.
#[derive(Debug, Default, Clone)]
pub struct StaticGeoIp {
    entries: Vec<(IpNetwork, String)>,
}

impl StaticGeoIp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, network: IpNetwork, country: impl Into<String>) -> Self {
        self.entries.push((network, country.into().to_ascii_uppercase()));
        self
    }
}

impl GeoIp for StaticGeoIp {
    fn country_code(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(ip))
            .map(|(_, cc)| cc.clone())
    }
}

/// Reverse DNS from a fixed address → hostname table.
#[derive(Debug, Default, Clone)]
pub struct StaticReverseDns {
    names: HashMap<IpAddr, String>,
}

impl StaticReverseDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, hostname: impl Into<String>) -> Self {
        self.names.insert(ip, hostname.into());
        self
    }
}

impl ReverseDns for StaticReverseDns {
    fn hostname(&self, ip: IpAddr) -> Option<String> {
        self.names.get(&ip).cloned()
    }
}

/// Caches another resolver's answers, including negative ones.
pub struct CachedReverseDns<R> {
    inner: R,
    cache: Cache<IpAddr, Option<String>>,
}

impl<R: ReverseDns> CachedReverseDns<R> {
    pub fn new(inner: R, capacity: u64, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl<R: ReverseDns> ReverseDns for CachedReverseDns<R> {
    fn hostname(&self, ip: IpAddr) -> Option<String> {
        self.cache.get_with(ip, || self.inner.hostname(ip))
    }
}

/// Location lookups used when verifying restrictions.
#[derive(Clone)]
pub struct Lookups {
    pub geoip: Arc<dyn GeoIp>,
    pub dns: Arc<dyn ReverseDns>,
}

impl Default for Lookups {
    fn default() -> Self {
        Self {
            geoip: Arc::new(NoGeoIp),
            dns: Arc::new(NoReverseDns),
        }
    }
}

impl std::fmt::Debug for Lookups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookups").finish_non_exhaustive()
    }
}

/// A parsed entry of a restriction's host list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    /// A single address or a CIDR network.
    Network(IpNetwork),
    /// A fully qualified hostname, lowercase without trailing dot.
    Hostname(String),
    /// `*.example.org`, stored as the suffix `.example.org`.
    Wildcard(String),
}

fn normalize_hostname(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl HostPattern {
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        if let Ok(net) = entry.parse::<IpNetwork>() {
            return HostPattern::Network(net);
        }
        match entry.strip_prefix('*') {
            Some(suffix) if !suffix.is_empty() => HostPattern::Wildcard(normalize_hostname(suffix)),
            _ => HostPattern::Hostname(normalize_hostname(entry)),
        }
    }

    /// Whether every address this pattern admits is also admitted by `self`.
    ///
    /// Hostnames and networks are never compared with each other, since that
    /// would need name resolution.
    pub fn covers(&self, child: &HostPattern) -> bool {
        match (self, child) {
            (HostPattern::Network(p), HostPattern::Network(c)) => {
                p.contains(c.network()) && c.prefix() >= p.prefix()
            }
            (HostPattern::Hostname(p), HostPattern::Hostname(c)) => p == c,
            (HostPattern::Wildcard(suffix), HostPattern::Hostname(c)) => c.ends_with(suffix.as_str()),
            (HostPattern::Wildcard(p), HostPattern::Wildcard(c)) => c.ends_with(p.as_str()),
            _ => false,
        }
    }

    /// Whether a requester at `ip` matches this pattern.
    pub fn matches_ip(&self, ip: IpAddr, dns: &dyn ReverseDns) -> bool {
        match self {
            HostPattern::Network(net) => net.contains(ip),
            HostPattern::Hostname(name) => dns
                .hostname(ip)
                .map(|h| normalize_hostname(&h) == *name)
                .unwrap_or(false),
            HostPattern::Wildcard(suffix) => dns
                .hostname(ip)
                .map(|h| normalize_hostname(&h).ends_with(suffix.as_str()))
                .unwrap_or(false),
        }
    }
}

/// Whether `ip` is admitted by any entry of `hosts`.
pub fn ip_is_in(ip: IpAddr, hosts: &[String], dns: &dyn ReverseDns) -> bool {
    hosts
        .iter()
        .any(|h| HostPattern::parse(h).matches_ip(ip, dns))
}

/// Whether every entry of `child` is covered by some entry of `parent`.
pub fn hosts_are_subset(child: &[String], parent: &[String]) -> bool {
    let parent: Vec<HostPattern> = parent.iter().map(|p| HostPattern::parse(p)).collect();
    child.iter().all(|c| {
        let c = HostPattern::parse(c);
        parent.iter().any(|p| p.covers(&c))
    })
}
