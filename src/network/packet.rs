//! Packet construction for DNS responses.
//!
//! Builds raw IPv4 or IPv6 + UDP frames with proper checksums, ready to be
//! written back into the tunnel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;

use super::checksum::{self, UDP_PROTOCOL};
use super::classify::{
    DNS_PORT, IPV4_HEADER_SIZE, IPV6_HEADER_SIZE, IpVersion, UDP_HEADER_SIZE, UdpDatagram,
};
use crate::error::{NetworkError, Result};

/// Default TTL / hop limit of synthesized packets.
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// Builder for DNS response packets.
///
/// The response travels the reverse path of the query: it comes from the
/// resolver address the application targeted inside the tunnel, from port 53,
/// to the application's own address and port.
#[derive(Clone, Copy, Debug)]
pub struct PacketBuilder {
    hop_limit: u8,
}

impl PacketBuilder {
    /// Create a builder stamping packets with the given TTL / hop limit.
    pub const fn new(hop_limit: u8) -> Self {
        Self { hop_limit }
    }

    /// Build a complete IP frame carrying `dns_response` back to the sender of
    /// `query`.
    ///
    /// The frame is validated before being returned: a packet whose checksums
    /// do not verify is never handed to the tunnel.
    pub fn build_response(&self, query: &UdpDatagram, dns_response: &[u8]) -> Result<Vec<u8>> {
        let frame = match (query.version, query.source_ip, query.dest_ip) {
            (IpVersion::V4, IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
                self.build_ipv4_response(dns_response, query.source_port, src_ip, dst_ip)?
            }
            (IpVersion::V6, IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
                self.build_ipv6_response(dns_response, query.source_port, src_ip, dst_ip)?
            }
            _ => {
                return Err(
                    NetworkError::PacketConstruction("mixed IPv4/IPv6 addresses".into()).into(),
                );
            }
        };

        if !validate(&frame, query.version) {
            return Err(NetworkError::ChecksumMismatch.into());
        }
        Ok(frame)
    }

    fn build_ipv4_response(
        &self,
        dns_response: &[u8],
        client_port: u16,
        client_ip: Ipv4Addr,
        resolver_ip: Ipv4Addr,
    ) -> Result<Vec<u8>> {
        let udp_len = UDP_HEADER_SIZE + dns_response.len();
        let total_len = length_field(IPV4_HEADER_SIZE + udp_len)?;

        let mut frame = vec![0u8; usize::from(total_len)];
        {
            let header = &mut frame[..IPV4_HEADER_SIZE];
            header[0] = 0x45;
            header[2..4].copy_from_slice(&total_len.to_be_bytes());
            header[8] = self.hop_limit;
            header[9] = UDP_PROTOCOL;
            // Swap: response goes from original dest to original source
            header[12..16].copy_from_slice(&resolver_ip.octets());
            header[16..20].copy_from_slice(&client_ip.octets());
            let ip_checksum = checksum::ipv4_header_checksum(header);
            header[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
        }

        write_udp(
            &mut frame[IPV4_HEADER_SIZE..],
            client_port,
            dns_response,
            resolver_ip.into(),
            client_ip.into(),
        )?;
        Ok(frame)
    }

    fn build_ipv6_response(
        &self,
        dns_response: &[u8],
        client_port: u16,
        client_ip: Ipv6Addr,
        resolver_ip: Ipv6Addr,
    ) -> Result<Vec<u8>> {
        let udp_len = UDP_HEADER_SIZE + dns_response.len();
        let payload_len = length_field(udp_len)?;

        let mut frame = vec![0u8; IPV6_HEADER_SIZE + udp_len];
        {
            let header = &mut frame[..IPV6_HEADER_SIZE];
            // Version 6, traffic class and flow label zero
            header[0] = 0x60;
            header[4..6].copy_from_slice(&payload_len.to_be_bytes());
            header[6] = UDP_PROTOCOL;
            header[7] = self.hop_limit;
            header[8..24].copy_from_slice(&resolver_ip.octets());
            header[24..40].copy_from_slice(&client_ip.octets());
        }

        write_udp(
            &mut frame[IPV6_HEADER_SIZE..],
            client_port,
            dns_response,
            resolver_ip.into(),
            client_ip.into(),
        )?;
        Ok(frame)
    }
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_HOP_LIMIT)
    }
}

fn length_field(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        NetworkError::PacketConstruction(format!("response of {len} bytes exceeds 65535")).into()
    })
}

/// Fill `segment` with a UDP header from port 53, the payload, and the
/// checksum over the pseudo-header of `source` and `destination`.
fn write_udp(
    segment: &mut [u8],
    client_port: u16,
    payload: &[u8],
    source: IpAddr,
    destination: IpAddr,
) -> Result<()> {
    let udp_len = length_field(segment.len())?;
    segment[0..2].copy_from_slice(&DNS_PORT.to_be_bytes());
    segment[2..4].copy_from_slice(&client_port.to_be_bytes());
    segment[4..6].copy_from_slice(&udp_len.to_be_bytes());
    segment[UDP_HEADER_SIZE..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_checksum(source, destination, segment);
    segment[6..8].copy_from_slice(&udp_checksum.to_be_bytes());
    Ok(())
}

/// Check every checksum carried by a frame built by [`PacketBuilder`].
fn validate(frame: &[u8], version: IpVersion) -> bool {
    match version {
        IpVersion::V4 => Ipv4Packet::new(frame).is_some_and(|ip| {
            let (header, segment) = frame.split_at(IPV4_HEADER_SIZE);
            checksum::verify_ipv4_header(header)
                && checksum::verify_udp(ip.get_source().into(), ip.get_destination().into(), segment)
        }),
        IpVersion::V6 => Ipv6Packet::new(frame).is_some_and(|ip| {
            checksum::verify_udp(
                ip.get_source().into(),
                ip.get_destination().into(),
                &frame[IPV6_HEADER_SIZE..],
            )
        }),
    }
}
