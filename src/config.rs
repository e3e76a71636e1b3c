//! Configuration loading and validation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result, ValidationError};

/// Smallest MTU that still carries every IPv6 packet unfragmented.
pub const MIN_IPV6_MTU: u16 = 1280;

/// Main configuration for the Sentinel engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Interface the host is asked to establish.
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Where allowed queries are forwarded.
    #[serde(default)]
    pub upstream: UpstreamSettings,

    /// Blocking behaviour and initial rules.
    #[serde(default)]
    pub policy: PolicySettings,

    /// Interval between two stats events, in milliseconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,

    /// Maximum number of queries resolved concurrently. Queries arriving
    /// while the limit is reached are dropped.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Tunnel interface settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSettings {
    #[serde(default = "default_tunnel_name")]
    pub name: String,

    #[serde(default = "default_ipv4_address")]
    pub ipv4_address: Ipv4Addr,

    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: u8,

    #[serde(default = "default_ipv6_address")]
    pub ipv6_address: Ipv6Addr,

    #[serde(default = "default_ipv6_prefix")]
    pub ipv6_prefix: u8,

    /// Resolvers advertised to the device. Queries to them enter the tunnel.
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<IpAddr>,

    /// Destination prefixes routed into the tunnel (e.g. "8.8.8.8/32").
    #[serde(default = "default_routes")]
    pub routes: Vec<Route>,

    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            name: default_tunnel_name(),
            ipv4_address: default_ipv4_address(),
            ipv4_prefix: default_ipv4_prefix(),
            ipv6_address: default_ipv6_address(),
            ipv6_prefix: default_ipv6_prefix(),
            dns_servers: default_dns_servers(),
            routes: default_routes(),
            mtu: default_mtu(),
        }
    }
}

/// Upstream resolution settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSettings {
    /// Public resolvers tried, in order, after the ones the underlying
    /// network provides.
    #[serde(default = "default_fallback")]
    pub fallback: Vec<IpAddr>,

    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Per-attempt response timeout in milliseconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
}

impl UpstreamSettings {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            fallback: default_fallback(),
            port: default_upstream_port(),
            timeout_ms: default_upstream_timeout(),
            max_response_size: default_max_response_size(),
        }
    }
}

/// How domain rules are compared against queried names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DomainMatch {
    /// The rule matches the name itself and any of its subdomains.
    #[default]
    LabelSuffix,
    /// The rule matches any name containing it.
    Substring,
}

/// What happens to a blocked query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockAction {
    /// No reply is written; the client times out.
    #[default]
    Drop,
    /// An NXDOMAIN reply is written back.
    Nxdomain,
}

/// Policy settings and rules loaded at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    #[serde(default)]
    pub domain_match: DomainMatch,

    #[serde(default)]
    pub block_action: BlockAction,

    /// Application identities whose queries are blocked.
    #[serde(default)]
    pub blocked_apps: Vec<String>,

    #[serde(default)]
    pub blocked_domains: Vec<String>,

    /// Resolved addresses that cause a response to be blocked.
    #[serde(default)]
    pub blocked_addresses: Vec<IpAddr>,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

/// A destination prefix routed into the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub address: IpAddr,
    pub prefix: u8,
}

impl FromStr for Route {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (address, prefix) = match s.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s, None),
        };
        let address: IpAddr = address.parse().map_err(ConfigError::InvalidAddress)?;
        let max_prefix = if address.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(prefix) => prefix
                .parse::<u8>()
                .ok()
                .filter(|prefix| *prefix <= max_prefix)
                .ok_or_else(|| ValidationError::InvalidRoute(s.to_string()))?,
            None => max_prefix,
        };
        Ok(Self { address, prefix })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl<'de> Deserialize<'de> for Route {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_tunnel_name() -> String {
    "sentinel0".to_string()
}

const fn default_ipv4_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 10, 1)
}

const fn default_ipv4_prefix() -> u8 {
    24
}

const fn default_ipv6_address() -> Ipv6Addr {
    Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)
}

const fn default_ipv6_prefix() -> u8 {
    64
}

const GOOGLE_DNS_V4: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);
const GOOGLE_DNS_V6: Ipv6Addr = Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888);

fn default_dns_servers() -> Vec<IpAddr> {
    vec![GOOGLE_DNS_V4.into(), GOOGLE_DNS_V6.into()]
}

fn default_routes() -> Vec<Route> {
    vec![
        Route {
            address: GOOGLE_DNS_V4.into(),
            prefix: 32,
        },
        Route {
            address: GOOGLE_DNS_V6.into(),
            prefix: 128,
        },
    ]
}

const fn default_mtu() -> u16 {
    MIN_IPV6_MTU
}

fn default_fallback() -> Vec<IpAddr> {
    vec![
        Ipv4Addr::new(1, 1, 1, 1).into(),
        Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111).into(),
        GOOGLE_DNS_V4.into(),
    ]
}

const fn default_upstream_port() -> u16 {
    53
}

const fn default_upstream_timeout() -> u64 {
    2000
}

const fn default_max_response_size() -> usize {
    4096
}

const fn default_stats_interval() -> u64 {
    1000
}

const fn default_max_in_flight() -> usize {
    256
}

const fn default_metrics_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnel: TunnelSettings::default(),
            upstream: UpstreamSettings::default(),
            policy: PolicySettings::default(),
            stats_interval_ms: default_stats_interval(),
            max_in_flight: default_max_in_flight(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub const fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let tunnel = &self.tunnel;
        if tunnel.name.is_empty() {
            return Err(ValidationError::EmptyTunnelName);
        }
        if tunnel.mtu < MIN_IPV6_MTU {
            return Err(ValidationError::MtuTooSmall {
                mtu: tunnel.mtu,
                minimum: MIN_IPV6_MTU,
            });
        }
        if !(1..=32).contains(&tunnel.ipv4_prefix) {
            return Err(ValidationError::InvalidIpv4Prefix(tunnel.ipv4_prefix));
        }
        if !(1..=128).contains(&tunnel.ipv6_prefix) {
            return Err(ValidationError::InvalidIpv6Prefix(tunnel.ipv6_prefix));
        }

        if self.upstream.fallback.is_empty() {
            return Err(ValidationError::NoFallbackServers);
        }
        if self.upstream.timeout_ms == 0 {
            return Err(ValidationError::ZeroUpstreamTimeout);
        }
        if self.upstream.max_response_size < 512 {
            return Err(ValidationError::ResponseBufferTooSmall(
                self.upstream.max_response_size,
            ));
        }

        if self.stats_interval_ms == 0 {
            return Err(ValidationError::ZeroStatsInterval);
        }
        if self.max_in_flight == 0 {
            return Err(ValidationError::ZeroMaxInFlight);
        }

        let policy = &self.policy;
        if policy
            .blocked_apps
            .iter()
            .chain(&policy.blocked_domains)
            .any(|rule| rule.trim().is_empty())
        {
            return Err(ValidationError::EmptyRule);
        }

        Ok(())
    }
}
