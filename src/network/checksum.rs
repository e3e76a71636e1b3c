//! Internet checksums (RFC 1071) for IPv4 headers and UDP datagrams.
//!
//! All functions are pure and operate on raw bytes, so they can be used both
//! to fill in checksums on synthesized packets and to validate them.

use std::net::IpAddr;

/// IP protocol number for UDP.
pub const UDP_PROTOCOL: u8 = 17;

/// Offset of the checksum field inside an IPv4 header.
const IPV4_CHECKSUM_OFFSET: usize = 10;
/// Offset of the checksum field inside a UDP header.
const UDP_CHECKSUM_OFFSET: usize = 6;

/// Sum a byte slice as big-endian 16-bit words. An odd trailing byte is
/// padded with a zero low byte.
fn sum_words(data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks
        .by_ref()
        .map(|pair| u64::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum();
    if let [last] = chunks.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// Sum `data` as if the 16-bit field at `offset` were zero.
fn sum_words_skipping(data: &[u8], offset: usize) -> u64 {
    let (head, rest) = data.split_at(offset.min(data.len()));
    sum_words(head) + sum_words(rest.get(2..).unwrap_or_default())
}

/// Fold carries above bit 16 back into the low 16 bits.
#[allow(clippy::cast_possible_truncation)]
fn fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

fn address_sum(address: IpAddr) -> u64 {
    match address {
        IpAddr::V4(ip) => sum_words(&ip.octets()),
        IpAddr::V6(ip) => sum_words(&ip.octets()),
    }
}

/// Sum of the UDP pseudo-header. The upper-layer length is added as a 32-bit
/// quantity, which covers the IPv6 layout and degenerates to the 16-bit IPv4
/// one for every valid datagram.
fn pseudo_header_sum(source: IpAddr, destination: IpAddr, length: usize) -> u64 {
    let length = length as u64;
    address_sum(source)
        + address_sum(destination)
        + (length >> 16)
        + (length & 0xFFFF)
        + u64::from(UDP_PROTOCOL)
}

/// Ones'-complement checksum of `data`.
///
/// Running this over a region whose checksum field is already filled in
/// yields zero when the checksum is valid.
pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data))
}

/// Compute the checksum of an IPv4 header, treating its checksum field as zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !fold(sum_words_skipping(header, IPV4_CHECKSUM_OFFSET))
}

/// Check that an IPv4 header carries a valid checksum.
pub fn verify_ipv4_header(header: &[u8]) -> bool {
    internet_checksum(header) == 0
}

/// Compute the UDP checksum of `segment` (UDP header followed by payload),
/// treating its checksum field as zero.
///
/// A result of zero is transmitted as `0xFFFF`: zero means "no checksum",
/// which IPv6 forbids.
pub fn udp_checksum(source: IpAddr, destination: IpAddr, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(source, destination, segment.len())
        + sum_words_skipping(segment, UDP_CHECKSUM_OFFSET);
    match !fold(sum) {
        0 => 0xFFFF,
        checksum => checksum,
    }
}

/// Check that a UDP segment carries a valid checksum for the given addresses.
pub fn verify_udp(source: IpAddr, destination: IpAddr, segment: &[u8]) -> bool {
    let sum = pseudo_header_sum(source, destination, segment.len()) + sum_words(segment);
    fold(sum) == 0xFFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    // Header from the classic RFC 1071 walkthrough, checksum 0xb861.
    const SAMPLE_HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8, 0x00,
        0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn should_compute_known_ipv4_header_checksum() {
        assert_eq!(ipv4_header_checksum(&SAMPLE_HEADER), 0xb861);
    }

    #[test]
    fn should_ignore_existing_checksum_field() {
        let mut header = SAMPLE_HEADER;
        header[10] = 0xde;
        header[11] = 0xad;
        assert_eq!(ipv4_header_checksum(&header), 0xb861);
    }

    #[test]
    fn should_verify_header_with_valid_checksum() {
        assert!(verify_ipv4_header(&SAMPLE_HEADER));

        let mut corrupted = SAMPLE_HEADER;
        corrupted[8] = 0x3f;
        assert!(!verify_ipv4_header(&corrupted));
    }

    #[test]
    fn should_pad_odd_trailing_byte_with_zero() {
        assert_eq!(sum_words(&[0x12, 0x34, 0x56]), 0x1234 + 0x5600);
        assert_eq!(sum_words(&[]), 0);
    }

    #[test]
    fn should_fold_carries_repeatedly() {
        assert_eq!(fold(0x0001_FFFF), 0x0001);
        assert_eq!(fold(0x0002_FFFE), 0x0001);
        assert_eq!(fold(0xFFFF), 0xFFFF);
    }

    fn udp_segment(payload: &[u8]) -> Vec<u8> {
        let length = u16::try_from(8 + payload.len()).unwrap();
        let mut segment = Vec::with_capacity(length as usize);
        segment.extend_from_slice(&53u16.to_be_bytes());
        segment.extend_from_slice(&40000u16.to_be_bytes());
        segment.extend_from_slice(&length.to_be_bytes());
        segment.extend_from_slice(&[0, 0]);
        segment.extend_from_slice(payload);
        segment
    }

    #[test]
    fn should_produce_self_checking_udp_checksum_over_ipv4() {
        let src = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 1, 10, 1));
        let mut segment = udp_segment(b"odd-length payload!");

        let checksum = udp_checksum(src, dst, &segment);
        segment[6..8].copy_from_slice(&checksum.to_be_bytes());

        assert!(verify_udp(src, dst, &segment));
        assert!(!verify_udp(dst, IpAddr::V4(Ipv4Addr::LOCALHOST), &segment));
    }

    #[test]
    fn should_produce_self_checking_udp_checksum_over_ipv6() {
        let src = IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888));
        let dst = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        let mut segment = udp_segment(&[0xab; 33]);

        let checksum = udp_checksum(src, dst, &segment);
        assert_ne!(checksum, 0);
        segment[6..8].copy_from_slice(&checksum.to_be_bytes());

        assert!(verify_udp(src, dst, &segment));
    }

    #[test]
    fn should_never_emit_zero_udp_checksum() {
        // Choose a payload word that cancels the rest of the sum exactly, so
        // the complemented result would be zero.
        let src = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        let dst = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
        let mut segment = udp_segment(&[0, 0]);
        let partial = fold(pseudo_header_sum(src, dst, segment.len()) + sum_words(&segment));
        segment[8..10].copy_from_slice(&(0xFFFF - partial).to_be_bytes());

        assert_eq!(udp_checksum(src, dst, &segment), 0xFFFF);
    }
}
