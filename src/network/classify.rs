//! Classification of raw IP frames read from the tunnel.
//!
//! Frames are read through `pnet` packet views. Anything that is not a
//! well-formed UDP datagram is rejected with `None`; callers drop those
//! frames silently.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::UdpPacket;

/// Well-known DNS port.
pub const DNS_PORT: u16 = 53;
/// Minimum IPv4 header size in bytes.
pub const IPV4_HEADER_SIZE: usize = 20;
/// Fixed IPv6 header size in bytes.
pub const IPV6_HEADER_SIZE: usize = 40;
/// UDP header size in bytes.
pub const UDP_HEADER_SIZE: usize = 8;

/// IP protocol version of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Label used for this transport in log events.
    pub const fn protocol_label(self) -> &'static str {
        match self {
            Self::V4 => "UDP",
            Self::V6 => "UDP6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("IPv4"),
            Self::V6 => f.write_str("IPv6"),
        }
    }
}

/// Network-layer summary of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpHeader {
    pub version: IpVersion,
    /// Offset at which the transport header begins.
    pub header_len: usize,
    /// IPv4 protocol or IPv6 next-header value.
    pub protocol: u8,
    pub source: IpAddr,
    pub destination: IpAddr,
}

/// A UDP datagram extracted from a frame, with its addressing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpDatagram {
    pub version: IpVersion,
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
    pub payload: Vec<u8>,
}

impl UdpDatagram {
    /// Address and port of the sender.
    pub const fn source(&self) -> SocketAddr {
        SocketAddr::new(self.source_ip, self.source_port)
    }

    /// Address and port of the receiver.
    pub const fn destination(&self) -> SocketAddr {
        SocketAddr::new(self.dest_ip, self.dest_port)
    }
}

/// Read the IP version, header length, transport protocol and addressing of
/// a frame.
///
/// Only frames without IPv6 extension headers are understood; a chained
/// next-header is reported as-is and will not match UDP.
pub fn parse_ip_header(frame: &[u8]) -> Option<IpHeader> {
    // Both versions carry the version nibble first, and any IPv6 frame is
    // long enough for an IPv4 view.
    let ipv4 = Ipv4Packet::new(frame)?;
    match ipv4.get_version() {
        4 => {
            let header_len = usize::from(ipv4.get_header_length()) * 4;
            if header_len < IPV4_HEADER_SIZE || frame.len() < header_len {
                return None;
            }
            Some(IpHeader {
                version: IpVersion::V4,
                header_len,
                protocol: ipv4.get_next_level_protocol().0,
                source: ipv4.get_source().into(),
                destination: ipv4.get_destination().into(),
            })
        }
        6 => {
            let ipv6 = Ipv6Packet::new(frame)?;
            Some(IpHeader {
                version: IpVersion::V6,
                header_len: IPV6_HEADER_SIZE,
                protocol: ipv6.get_next_header().0,
                source: ipv6.get_source().into(),
                destination: ipv6.get_destination().into(),
            })
        }
        _ => None,
    }
}

/// Extract the UDP datagram carried by a frame, whatever its ports.
///
/// Returns None if:
/// - The frame is not IPv4 or IPv6
/// - The transport is not UDP
/// - The UDP length is shorter than its header, declares an empty payload,
///   or runs past the end of the frame
pub fn parse_udp(frame: &[u8]) -> Option<UdpDatagram> {
    let header = parse_ip_header(frame)?;
    if header.protocol != IpNextHeaderProtocols::Udp.0 {
        return None;
    }

    let segment = &frame[header.header_len..];
    let udp = UdpPacket::new(segment)?;
    let udp_len = usize::from(udp.get_length());
    if udp_len <= UDP_HEADER_SIZE || udp_len > segment.len() {
        return None;
    }

    Some(UdpDatagram {
        version: header.version,
        source_ip: header.source,
        dest_ip: header.destination,
        source_port: udp.get_source(),
        dest_port: udp.get_destination(),
        payload: segment[UDP_HEADER_SIZE..udp_len].to_vec(),
    })
}

/// Extract a DNS query from a frame.
///
/// Returns None unless the frame is a well-formed UDP datagram addressed to
/// port 53.
pub fn extract_dns_query(frame: &[u8]) -> Option<UdpDatagram> {
    parse_udp(frame).filter(|datagram| datagram.dest_port == DNS_PORT)
}
