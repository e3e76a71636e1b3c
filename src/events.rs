//! Commands accepted by the engine and events it emits.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::CommandError;
use crate::network::UdpDatagram;

/// Reason reported for allowed queries whose application is unknown.
pub const ALLOWED: &str = "Allowed";

/// One observed DNS query and what happened to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Queried name; absent when it could not be parsed.
    pub domain: Option<String>,
    /// Address of the querying client inside the tunnel.
    pub source_address: IpAddr,
    /// `UDP` or `UDP6`.
    pub protocol: &'static str,
    pub blocked: bool,
    /// Block reason, or the owning application for allowed queries.
    pub reason: String,
}

impl LogEvent {
    pub fn new(query: &UdpDatagram, domain: Option<String>, blocked: bool, reason: String) -> Self {
        Self {
            timestamp_ms: now_ms(),
            domain,
            source_address: query.source_ip,
            protocol: query.version.protocol_label(),
            blocked,
            reason,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

/// Events streamed to whoever drives the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Log(LogEvent),
    Status { running: bool },
    Stats { bytes_in: u64, bytes_out: u64 },
}

/// Commands accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    SetAppRule { package: String, blocked: bool },
    SetDomainRule { domain: String, blocked: bool },
    SetIpRule { address: String, blocked: bool },
}

impl FromStr for Command {
    type Err = CommandError;

    /// Parse one command line: `start`, `stop`, `app <package> on|off`,
    /// `domain <name> on|off` or `ip <address> on|off`.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err(CommandError::Empty);
        };
        let args: Vec<&str> = words.collect();

        let rule = |usage: &'static str| -> Result<(String, bool), CommandError> {
            match args.as_slice() {
                [target, "on"] => Ok(((*target).to_string(), true)),
                [target, "off"] => Ok(((*target).to_string(), false)),
                _ => Err(CommandError::Usage(usage)),
            }
        };

        match verb.to_ascii_lowercase().as_str() {
            "start" if args.is_empty() => Ok(Self::Start),
            "stop" if args.is_empty() => Ok(Self::Stop),
            "start" => Err(CommandError::Usage("start")),
            "stop" => Err(CommandError::Usage("stop")),
            "app" => {
                let (package, blocked) = rule("app <package> on|off")?;
                Ok(Self::SetAppRule { package, blocked })
            }
            "domain" => {
                let (domain, blocked) = rule("domain <name> on|off")?;
                Ok(Self::SetDomainRule { domain, blocked })
            }
            "ip" => {
                let (address, blocked) = rule("ip <address> on|off")?;
                Ok(Self::SetIpRule { address, blocked })
            }
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |blocked: bool| if blocked { "on" } else { "off" };
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
            Self::SetAppRule { package, blocked } => write!(f, "app {package} {}", flag(*blocked)),
            Self::SetDomainRule { domain, blocked } => {
                write!(f, "domain {domain} {}", flag(*blocked))
            }
            Self::SetIpRule { address, blocked } => write!(f, "ip {address} {}", flag(*blocked)),
        }
    }
}

/// Byte counters for traffic through the tunnel.
///
/// Both counters are drained with an atomic swap, so bytes recorded while a
/// snapshot is taken land in the next one.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Read and reset both counters.
    pub fn take(&self) -> (u64, u64) {
        (
            self.bytes_in.swap(0, Ordering::AcqRel),
            self.bytes_out.swap(0, Ordering::AcqRel),
        )
    }

    /// Current values without resetting.
    pub fn peek(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Acquire),
            self.bytes_out.load(Ordering::Acquire),
        )
    }
}
