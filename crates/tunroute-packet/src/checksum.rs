//! RFC 1071 internet checksum helpers.

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Adds `data` to a running one's-complement sum as big-endian 16-bit words.
///
/// An odd trailing byte is padded with zero on the right.
pub fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Folds the carries and returns the one's complement of the sum.
pub fn finalize_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    finalize_checksum(sum_words(0, header))
}

pub fn checksum_pseudo_header_v4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
    let mut sum = sum_words(0, &src.octets());
    sum = sum_words(sum, &dst.octets());
    sum += protocol as u32;
    sum += len as u32;
    sum
}

pub fn checksum_pseudo_header_v6(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, len: u32) -> u32 {
    let mut sum = sum_words(0, &src.octets());
    sum = sum_words(sum, &dst.octets());
    sum += len >> 16;
    sum += len & 0xffff;
    sum += next_header as u32;
    sum
}

/// Pseudo-header sum for either family. Mixed families yield `None`.
pub fn checksum_pseudo_header(src: IpAddr, dst: IpAddr, protocol: u8, len: usize) -> Option<u32> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            Some(checksum_pseudo_header_v4(src, dst, protocol, len as u16))
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            Some(checksum_pseudo_header_v6(src, dst, protocol, len as u32))
        }
        _ => None,
    }
}

/// Transport checksum (TCP/UDP) over pseudo-header + `segment`.
///
/// `segment` must already have its checksum field zeroed.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> Option<u16> {
    let pseudo = checksum_pseudo_header(src, dst, protocol, segment.len())?;
    Some(finalize_checksum(sum_words(pseudo, segment)))
}
