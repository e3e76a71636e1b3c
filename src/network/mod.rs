//! Network-related modules: frame classification, checksums, response
//! packet construction and tunnel I/O.

pub mod checksum;
pub mod classify;
mod packet;
pub mod tunnel;

pub use classify::{IpVersion, UdpDatagram, extract_dns_query, parse_ip_header, parse_udp};
pub use packet::PacketBuilder;
pub use tunnel::{Tunnel, TunnelConfig, TunnelProvider, TunnelReader, TunnelWriter};
