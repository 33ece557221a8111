//! Configuration types
//!
//! This module defines the handler configuration, the immutable destination
//! descriptor handed to the handler for outbound dialing and binding, the
//! proxy sub-descriptor, and the rate limit descriptor shared by the group
//! buckets and per-connection overrides.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sentinel rate meaning "no throttling"
pub const RATE_LIMIT_MAX: u32 = u32::MAX;

/// Default per-attempt connect timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

fn default_incoming_limit() -> usize {
    125
}

fn default_bind_limit() -> usize {
    8
}

fn default_total_limit() -> usize {
    1024
}

fn default_high_watermark() -> usize {
    256 * 1024
}

fn default_low_watermark() -> usize {
    64 * 1024
}

fn default_accept_backlog() -> u32 {
    128
}

/// DNS policy for a destination host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Resolve the host if it is not a literal address
    Resolve,
    /// The host must already be a literal address
    NoResolve,
    /// Resolve the host and report the results without connecting
    ResolveOnly,
}

/// Address family filter applied during resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveFamily {
    /// IPv4 addresses only
    Ipv4,
    /// IPv6 addresses only
    Ipv6,
    /// No filtering
    Any,
}

impl ResolveFamily {
    /// Check whether an address passes this filter
    #[must_use]
    pub const fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Ipv4 => addr.is_ipv4(),
            Self::Ipv6 => addr.is_ipv6(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for ResolveFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "ipv4"),
            Self::Ipv6 => write!(f, "ipv6"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Rate limit descriptor
///
/// Rates are bytes per second, bursts are bytes. [`RATE_LIMIT_MAX`] in a rate
/// field disables throttling for that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum sustained read rate (bytes/sec)
    pub max_read_rate: u32,
    /// Maximum read burst (bytes)
    pub max_read_burst: u32,
    /// Maximum sustained write rate (bytes/sec)
    pub max_write_rate: u32,
    /// Maximum write burst (bytes)
    pub max_write_burst: u32,
}

impl RateLimit {
    /// A limit that does not throttle either direction
    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_read_rate: RATE_LIMIT_MAX,
            max_read_burst: RATE_LIMIT_MAX,
            max_write_rate: RATE_LIMIT_MAX,
            max_write_burst: RATE_LIMIT_MAX,
        }
    }

    /// Check if reads are unthrottled
    #[must_use]
    pub const fn read_unlimited(&self) -> bool {
        self.max_read_rate == RATE_LIMIT_MAX
    }

    /// Check if writes are unthrottled
    #[must_use]
    pub const fn write_unlimited(&self) -> bool {
        self.max_write_rate == RATE_LIMIT_MAX
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// SOCKS5 proxy sub-descriptor for a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy server address
    pub addr: SocketAddr,
    /// Username for authentication (optional)
    pub username: Option<String>,
    /// Password for authentication (optional)
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Create a proxy descriptor without authentication
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            username: None,
            password: None,
        }
    }

    /// Set authentication credentials
    #[must_use]
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Check if authentication is configured
    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Immutable descriptor of a requested peer endpoint
///
/// Carries everything the handler needs to reach one peer: host and port, the
/// DNS policy, the per-attempt timeout, the retry budget, an optional proxy
/// descriptor, and an opaque network-config blob passed through to the framer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Host name or literal address
    pub host: String,
    /// Destination port
    pub port: u16,
    /// DNS policy
    #[serde(default = "default_resolve_mode")]
    pub resolve: ResolveMode,
    /// Address family filter for resolution
    #[serde(default = "default_resolve_family")]
    pub family: ResolveFamily,
    /// Per-attempt connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub timeout_secs: u64,
    /// Retry budget; negative means retry forever
    #[serde(default)]
    pub retries: i32,
    /// Optional SOCKS5 proxy to tunnel through
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Opaque blob handed to the embedder's framer factory
    #[serde(default)]
    pub net_config: Vec<u8>,
}

fn default_resolve_mode() -> ResolveMode {
    ResolveMode::Resolve
}

fn default_resolve_family() -> ResolveFamily {
    ResolveFamily::Any
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Destination {
    /// Create a destination for a host name or literal address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            resolve: ResolveMode::Resolve,
            family: ResolveFamily::Any,
            timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            retries: 0,
            proxy: None,
            net_config: Vec::new(),
        }
    }

    /// Create a destination from a concrete socket address
    #[must_use]
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            resolve: ResolveMode::NoResolve,
            family: ResolveFamily::Any,
            timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            retries: 0,
            proxy: None,
            net_config: Vec::new(),
        }
    }

    /// Set the DNS policy
    #[must_use]
    pub const fn with_resolve_mode(mut self, mode: ResolveMode) -> Self {
        self.resolve = mode;
        self
    }

    /// Set the address family filter
    #[must_use]
    pub const fn with_family(mut self, family: ResolveFamily) -> Self {
        self.family = family;
        self
    }

    /// Set the per-attempt connect timeout
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the retry budget; negative retries forever
    #[must_use]
    pub const fn with_retries(mut self, retries: i32) -> Self {
        self.retries = retries;
        self
    }

    /// Route this destination through a SOCKS5 proxy
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Attach the opaque network-config blob
    #[must_use]
    pub fn with_net_config(mut self, blob: impl Into<Vec<u8>>) -> Self {
        self.net_config = blob.into();
        self
    }

    /// Check whether this descriptor names an endpoint at all
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.host.is_empty()
    }

    /// Parse the host as a literal address, if it is one
    #[must_use]
    pub fn literal_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Check whether the host needs DNS to become connectable
    #[must_use]
    pub fn needs_resolution(&self) -> bool {
        self.literal_addr().is_none()
    }

    /// Per-attempt connect timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Synthesize the resolved form of this destination for one address
    ///
    /// Keeps every option but pins the endpoint to `addr` with resolution
    /// disabled.
    #[must_use]
    pub fn resolved_to(&self, addr: SocketAddr) -> Self {
        let mut resolved = self.clone();
        resolved.host = addr.ip().to_string();
        resolved.port = addr.port();
        resolved.resolve = ResolveMode::NoResolve;
        resolved
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Handler-wide configuration
///
/// The outbound limit is passed to `start` rather than carried here, so the
/// same configuration can be reused across restarts with different outbound
/// populations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Maximum established inbound connections
    #[serde(default = "default_incoming_limit")]
    pub incoming_limit: usize,
    /// Maximum simultaneous listeners
    #[serde(default = "default_bind_limit")]
    pub bind_limit: usize,
    /// Maximum established connections in both directions
    #[serde(default = "default_total_limit")]
    pub total_limit: usize,
    /// Write buffer size above which `on_write_buffer_full` fires
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Write buffer size below which `on_write_buffer_ready` fires
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,
    /// Listen backlog for bound sockets
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: u32,
    /// Enable TCP keepalive on established streams
    #[serde(default)]
    pub tcp_keepalive: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            incoming_limit: default_incoming_limit(),
            bind_limit: default_bind_limit(),
            total_limit: default_total_limit(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            accept_backlog: default_accept_backlog(),
            tcp_keepalive: false,
        }
    }
}

impl HandlerConfig {
    /// Validate watermark and limit consistency
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first inconsistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.low_watermark >= self.high_watermark {
            return Err(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            ));
        }
        if self.total_limit == 0 {
            return Err("total_limit must be non-zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_literal() {
        let d = Destination::new("203.0.113.7", 8333);
        assert!(d.is_set());
        assert!(!d.needs_resolution());
        assert_eq!(d.literal_addr(), Some("203.0.113.7:8333".parse().unwrap()));
    }

    #[test]
    fn test_destination_hostname() {
        let d = Destination::new("seed.example.org", 8333);
        assert!(d.needs_resolution());
        assert!(d.literal_addr().is_none());
    }

    #[test]
    fn test_destination_unset() {
        let d = Destination::new("", 0);
        assert!(!d.is_set());
    }

    #[test]
    fn test_resolved_to_keeps_options() {
        let d = Destination::new("seed.example.org", 8333)
            .with_retries(3)
            .with_timeout_secs(5)
            .with_net_config(vec![1, 2, 3]);
        let addr: SocketAddr = "198.51.100.1:8333".parse().unwrap();
        let r = d.resolved_to(addr);

        assert_eq!(r.host, "198.51.100.1");
        assert_eq!(r.port, 8333);
        assert_eq!(r.resolve, ResolveMode::NoResolve);
        assert_eq!(r.retries, 3);
        assert_eq!(r.timeout_secs, 5);
        assert_eq!(r.net_config, vec![1, 2, 3]);
        assert!(!r.needs_resolution());
    }

    #[test]
    fn test_family_filter() {
        let v4: SocketAddr = "198.51.100.1:1".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:1".parse().unwrap();

        assert!(ResolveFamily::Any.admits(&v4));
        assert!(ResolveFamily::Any.admits(&v6));
        assert!(ResolveFamily::Ipv4.admits(&v4));
        assert!(!ResolveFamily::Ipv4.admits(&v6));
        assert!(ResolveFamily::Ipv6.admits(&v6));
        assert!(!ResolveFamily::Ipv6.admits(&v4));
    }

    #[test]
    fn test_rate_limit_sentinel() {
        let unlimited = RateLimit::unlimited();
        assert!(unlimited.read_unlimited());
        assert!(unlimited.write_unlimited());

        let capped = RateLimit {
            max_read_rate: 1024,
            max_read_burst: 2048,
            max_write_rate: RATE_LIMIT_MAX,
            max_write_burst: RATE_LIMIT_MAX,
        };
        assert!(!capped.read_unlimited());
        assert!(capped.write_unlimited());
    }

    #[test]
    fn test_proxy_auth() {
        let p = ProxyConfig::new("127.0.0.1:1080".parse().unwrap());
        assert!(!p.has_auth());
        let p = p.with_auth("user", "pass");
        assert!(p.has_auth());
    }

    #[test]
    fn test_config_validation() {
        assert!(HandlerConfig::default().validate().is_ok());

        let bad = HandlerConfig {
            low_watermark: 1024,
            high_watermark: 512,
            ..HandlerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_destination_serde_defaults() {
        let d: Destination =
            serde_json::from_str(r#"{"host": "peer.example.org", "port": 8333}"#).unwrap();
        assert_eq!(d.resolve, ResolveMode::Resolve);
        assert_eq!(d.family, ResolveFamily::Any);
        assert_eq!(d.retries, 0);
        assert!(d.proxy.is_none());
        assert!(d.net_config.is_empty());
    }
}
