//! Linux host platform.
//!
//! Establishes a TUN interface, routes the advertised resolver addresses into
//! it, and keeps upstream sockets out of it by binding them to the interface
//! carrying the default route.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};
use crate::network::tunnel::{StreamReader, StreamWriter};
use crate::network::{Tunnel, TunnelConfig, TunnelProvider};
use crate::platform::{AppResolver, NetworkBypass};

const ROUTE_TABLE: &str = "/proc/net/route";
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Host platform backed by the Linux TUN driver and the `ip` tool.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    tunnel_name: String,
    route_table: PathBuf,
    resolv_conf: PathBuf,
}

impl LinuxHost {
    pub fn new(tunnel_name: impl Into<String>) -> Self {
        Self {
            tunnel_name: tunnel_name.into(),
            route_table: ROUTE_TABLE.into(),
            resolv_conf: RESOLV_CONF.into(),
        }
    }
}

impl TunnelProvider for LinuxHost {
    type Reader = StreamReader<ReadHalf<tun::AsyncDevice>>;
    type Writer = StreamWriter<WriteHalf<tun::AsyncDevice>>;

    async fn establish(&self, config: &TunnelConfig) -> Result<Tunnel<Self::Reader, Self::Writer>> {
        let device = {
            let mut tun_config = tun::Configuration::default();
            tun_config
                .tun_name(&config.name)
                .address(config.ipv4_address)
                .netmask(prefix_to_netmask(config.ipv4_prefix))
                .mtu(config.mtu)
                .up();
            tun_config.platform_config(|platform| {
                platform.ensure_root_privileges(true);
            });
            tun::create_as_async(&tun_config)
                .map_err(|err| NetworkError::TunnelEstablish(err.to_string()))?
        };

        let v6 = format!("{}/{}", config.ipv6_address, config.ipv6_prefix);
        ip(&["-6", "addr", "replace", &v6, "dev", &config.name]).await?;
        for route in &config.routes {
            let family = if route.address.is_ipv4() { "-4" } else { "-6" };
            ip(&[family, "route", "replace", &route.to_string(), "dev", &config.name]).await?;
        }
        info!(
            name = %config.name,
            routes = config.routes.len(),
            "tunnel interface up"
        );

        let (reader, writer) = tokio::io::split(device);
        Ok(Tunnel {
            reader: StreamReader::new(reader, usize::from(config.mtu)),
            writer: StreamWriter::new(writer),
        })
    }
}

impl NetworkBypass for LinuxHost {
    /// Name of the interface holding the default route.
    type Network = String;

    fn discover_network(&self) -> Option<String> {
        let table = std::fs::read_to_string(&self.route_table)
            .inspect_err(|err| debug!("cannot read routing table: {err}"))
            .ok()?;
        default_interface(&table, &self.tunnel_name)
    }

    fn dns_servers(&self, _network: &String) -> Vec<String> {
        std::fs::read_to_string(&self.resolv_conf)
            .map(|content| nameservers(&content))
            .unwrap_or_default()
    }

    fn bind_to_network(&self, socket: &UdpSocket, network: &String) -> bool {
        socket2::SockRef::from(socket)
            .bind_device(Some(network.as_bytes()))
            .inspect_err(|err| debug!(%network, "cannot bind upstream socket: {err}"))
            .is_ok()
    }

    fn protect(&self, _socket: &UdpSocket) -> bool {
        // Without a known interface there is nothing to steer the socket to.
        false
    }
}

impl AppResolver for LinuxHost {
    fn owning_application(&self, _: u8, _: SocketAddr, _: SocketAddr) -> Option<String> {
        None
    }
}

async fn ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|err| NetworkError::TunnelEstablish(format!("failed to run ip: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(?args, "ip failed: {}", stderr.trim());
        return Err(NetworkError::TunnelEstablish(format!(
            "ip {}: {}",
            args.join(" "),
            stderr.trim()
        ))
        .into());
    }
    Ok(())
}

fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0);
    Ipv4Addr::from(bits)
}

/// Interface of the IPv4 default route in `/proc/net/route` format, skipping
/// the tunnel itself.
fn default_interface(table: &str, tunnel: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [iface, "00000000", ..] if *iface != tunnel => Some((*iface).to_string()),
            _ => None,
        }
    })
}

/// Non-loopback `nameserver` entries of a resolv.conf.
fn nameservers(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("nameserver"))
        .map(str::trim)
        .filter(|server| {
            server
                .parse::<IpAddr>()
                .map_or(true, |ip| !ip.is_loopback())
        })
        .map(ToString::to_string)
        .collect()
}
