//! Endpoint security validation
//!
//! Operator-supplied endpoints for network backends (S3 endpoint, SFTP host,
//! NFS server, Redis address) are resolved and classified before any
//! connection is attempted. Unless the persisted policy allows local
//! addresses, an endpoint resolving into a private, loopback, link-local or
//! unique-local range is refused.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Blocked address range category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RangeCategory {
    /// RFC 1918 (10/8, 172.16/12, 192.168/16)
    Private,
    /// 127/8, ::1
    Loopback,
    /// 169.254/16, fe80::/10
    LinkLocal,
    /// fc00::/7
    UniqueLocal,
    /// 0/8, ::
    Unspecified,
}

impl RangeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangeCategory::Private => "private",
            RangeCategory::Loopback => "loopback",
            RangeCategory::LinkLocal => "link-local",
            RangeCategory::UniqueLocal => "unique-local",
            RangeCategory::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for RangeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blocked ranges in match order, for diagnostics.
pub const BLOCKED_RANGES: &[(&str, RangeCategory)] = &[
    ("10.0.0.0/8", RangeCategory::Private),
    ("172.16.0.0/12", RangeCategory::Private),
    ("192.168.0.0/16", RangeCategory::Private),
    ("127.0.0.0/8", RangeCategory::Loopback),
    ("169.254.0.0/16", RangeCategory::LinkLocal),
    ("0.0.0.0/8", RangeCategory::Unspecified),
    ("::1/128", RangeCategory::Loopback),
    ("fc00::/7", RangeCategory::UniqueLocal),
    ("fe80::/10", RangeCategory::LinkLocal),
    ("::/128", RangeCategory::Unspecified),
];

fn classify_v4(ip: Ipv4Addr) -> Option<RangeCategory> {
    if ip.is_private() {
        Some(RangeCategory::Private)
    } else if ip.is_loopback() {
        Some(RangeCategory::Loopback)
    } else if ip.is_link_local() {
        Some(RangeCategory::LinkLocal)
    } else if ip.octets()[0] == 0 {
        Some(RangeCategory::Unspecified)
    } else {
        None
    }
}

fn classify_v6(ip: Ipv6Addr) -> Option<RangeCategory> {
    // IPv4-mapped addresses are judged by the embedded IPv4 address
    if let Some(v4) = ip.to_ipv4_mapped() {
        return classify_v4(v4);
    }
    let first = ip.segments()[0];
    if ip.is_loopback() {
        Some(RangeCategory::Loopback)
    } else if ip.is_unspecified() {
        Some(RangeCategory::Unspecified)
    } else if first & 0xfe00 == 0xfc00 {
        Some(RangeCategory::UniqueLocal)
    } else if first & 0xffc0 == 0xfe80 {
        Some(RangeCategory::LinkLocal)
    } else {
        None
    }
}

/// Match an address against the blocked-range table.
pub fn classify(ip: IpAddr) -> Option<RangeCategory> {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

/// Host part of an endpoint string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointHost {
    Addr(IpAddr),
    Name(String),
}

impl fmt::Display for EndpointHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointHost::Addr(ip) => write!(f, "{}", ip),
            EndpointHost::Name(name) => f.write_str(name),
        }
    }
}

/// Extract the host from a bare host, `host:port`, `[v6]:port`, bare IPv6
/// literal or a full URL.
pub fn extract_host(endpoint: &str) -> StorageResult<(EndpointHost, Option<u16>)> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(StorageError::InvalidConfig("endpoint is empty".into()));
    }

    if endpoint.contains("://") {
        let parsed = url::Url::parse(endpoint)
            .map_err(|e| StorageError::InvalidConfig(format!("invalid endpoint URL: {}", e)))?;
        let port = parsed.port_or_known_default();
        let host = match parsed.host() {
            Some(url::Host::Ipv4(ip)) => EndpointHost::Addr(IpAddr::V4(ip)),
            Some(url::Host::Ipv6(ip)) => EndpointHost::Addr(IpAddr::V6(ip)),
            Some(url::Host::Domain(name)) => EndpointHost::Name(name.to_string()),
            None => {
                return Err(StorageError::InvalidConfig(format!(
                    "endpoint URL has no host: {}",
                    endpoint
                )))
            }
        };
        return Ok((host, port));
    }

    if let Some(rest) = endpoint.strip_prefix('[') {
        let (inner, tail) = rest.split_once(']').ok_or_else(|| {
            StorageError::InvalidConfig(format!("unterminated IPv6 literal: {}", endpoint))
        })?;
        let ip: Ipv6Addr = inner
            .parse()
            .map_err(|_| StorageError::InvalidConfig(format!("invalid IPv6 literal: {}", inner)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((EndpointHost::Addr(IpAddr::V6(ip)), port));
    }

    if let Ok(ip) = endpoint.parse::<IpAddr>() {
        return Ok((EndpointHost::Addr(ip), None));
    }

    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(parse_port(port)?)),
        _ => (endpoint, None),
    };
    let host = host.trim_end_matches('/');
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok((EndpointHost::Addr(ip), port)),
        Err(_) => Ok((EndpointHost::Name(host.to_ascii_lowercase()), port)),
    }
}

fn parse_port(text: &str) -> StorageResult<u16> {
    text.trim_end_matches('/')
        .parse()
        .map_err(|_| StorageError::InvalidConfig(format!("invalid port: {}", text)))
}

/// One resolved address and its verdict
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressVerdict {
    pub address: String,
    pub category: Option<RangeCategory>,
}

/// Diagnostic result of validating an endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointReport {
    pub endpoint: String,
    pub host: String,
    pub addresses: Vec<AddressVerdict>,
    pub allow_local_addresses: bool,
    pub allowed: bool,
    /// First blocked category, when refused
    pub blocked_by: Option<RangeCategory>,
}

/// Persisted blocked-range policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicy {
    #[serde(default)]
    pub allow_local_addresses: bool,
}

/// Validator for network endpoints. Pure function of the policy flag it was
/// built with.
#[derive(Debug, Clone, Copy)]
pub struct EndpointValidator {
    allow_local: bool,
}

impl Default for EndpointValidator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl EndpointValidator {
    pub fn new(allow_local: bool) -> Self {
        Self { allow_local }
    }

    pub fn from_policy(policy: &SecurityPolicy) -> Self {
        Self::new(policy.allow_local_addresses)
    }

    pub fn allows_local(&self) -> bool {
        self.allow_local
    }

    /// Refuse endpoints resolving into a blocked range.
    pub async fn validate(&self, endpoint: &str) -> StorageResult<()> {
        let (host, _) = extract_host(endpoint)?;
        if self.allow_local {
            debug!("Local addresses allowed, accepting endpoint {}", endpoint);
            return Ok(());
        }

        for ip in resolve(&host).await? {
            if let Some(category) = classify(ip) {
                warn!(
                    "Endpoint {} blocked: {} is a {} address",
                    endpoint, ip, category
                );
                return Err(StorageError::EndpointBlocked {
                    endpoint: endpoint.to_string(),
                    category,
                });
            }
        }
        debug!("Endpoint {} passed validation", endpoint);
        Ok(())
    }

    /// Resolve and classify every address without failing on a blocked one.
    pub async fn report(&self, endpoint: &str) -> StorageResult<EndpointReport> {
        let (host, _) = extract_host(endpoint)?;
        let addresses: Vec<AddressVerdict> = resolve(&host)
            .await?
            .into_iter()
            .map(|ip| AddressVerdict {
                address: ip.to_string(),
                category: classify(ip),
            })
            .collect();

        let blocked_by = addresses.iter().find_map(|a| a.category);
        Ok(EndpointReport {
            endpoint: endpoint.to_string(),
            host: host.to_string(),
            allow_local_addresses: self.allow_local,
            allowed: self.allow_local || blocked_by.is_none(),
            blocked_by,
            addresses,
        })
    }
}

/// Resolve a host into every address of both families.
async fn resolve(host: &EndpointHost) -> StorageResult<Vec<IpAddr>> {
    match host {
        EndpointHost::Addr(ip) => Ok(vec![*ip]),
        EndpointHost::Name(name) => {
            let mut ips: Vec<IpAddr> = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| StorageError::Transient(format!("failed to resolve {}: {}", name, e)))?
                .map(|addr| addr.ip())
                .collect();
            ips.dedup();
            if ips.is_empty() {
                return Err(StorageError::Transient(format!(
                    "{} resolved to no addresses",
                    name
                )));
            }
            debug!("Resolved {} to {:?}", name, ips);
            Ok(ips)
        }
    }
}
