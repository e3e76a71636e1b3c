//! Error types for the Sentinel interception engine.

use std::io;
use std::net::AddrParseError;

use thiserror::Error;

/// Main error type for Sentinel operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(#[source] AddrParseError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tunnel.mtu must be at least {minimum}, got {mtu}")]
    MtuTooSmall { mtu: u16, minimum: u16 },

    #[error("tunnel.ipv4_prefix must be between 1 and 32, got {0}")]
    InvalidIpv4Prefix(u8),

    #[error("tunnel.ipv6_prefix must be between 1 and 128, got {0}")]
    InvalidIpv6Prefix(u8),

    #[error("invalid route {0:?}")]
    InvalidRoute(String),

    #[error("tunnel.name cannot be empty")]
    EmptyTunnelName,

    #[error("upstream.fallback must contain at least one server")]
    NoFallbackServers,

    #[error("upstream.timeout_ms must be greater than 0")]
    ZeroUpstreamTimeout,

    #[error("upstream.max_response_size must be at least 512, got {0}")]
    ResponseBufferTooSmall(usize),

    #[error("stats_interval_ms must be greater than 0")]
    ZeroStatsInterval,

    #[error("max_in_flight must be greater than 0")]
    ZeroMaxInFlight,

    #[error("policy rule cannot be empty")]
    EmptyRule,
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to establish tunnel: {0}")]
    TunnelEstablish(String),

    #[error("packet construction failed: {0}")]
    PacketConstruction(String),

    #[error("synthesized packet failed checksum validation")]
    ChecksumMismatch,
}

/// Errors raised while talking to upstream resolvers.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("no bypass available for upstream {0}")]
    Bypass(std::net::IpAddr),

    #[error("upstream {0} did not answer in time")]
    Timeout(std::net::IpAddr),

    #[error("all {attempts} upstream candidates failed")]
    Exhausted { attempts: usize },
}

/// Errors raised by rule updates.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("rule value cannot be empty")]
    EmptyRule,

    #[error("invalid address rule {value:?}")]
    InvalidAddress {
        value: String,
        #[source]
        source: AddrParseError,
    },
}

/// Errors raised while parsing a command line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
