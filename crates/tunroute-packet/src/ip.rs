use crate::checksum::ipv4_header_checksum;
use crate::PacketError;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// Length of the fixed header we emit for this version.
    pub const fn header_len(self) -> usize {
        match self {
            IpVersion::V4 => IPV4_HEADER_LEN,
            IpVersion::V6 => IPV6_HEADER_LEN,
        }
    }
}

/// Parsed network-layer header of an inbound packet.
///
/// `header_len` covers IPv4 options; IPv6 extension headers are not walked, so an IPv6 packet whose
/// next header is not a transport we handle simply reports that protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpHeader {
    pub version: IpVersion,
    pub header_len: usize,
    /// Header plus payload, as declared by the header (trailing link padding excluded).
    pub total_len: usize,
    pub protocol: u8,
    pub ttl: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl IpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        let Some(first) = buf.first() else {
            return Err(PacketError::Truncated);
        };
        match first >> 4 {
            4 => Self::parse_v4(buf),
            6 => Self::parse_v6(buf),
            other => Err(PacketError::UnsupportedVersion(other)),
        }
    }

    fn parse_v4(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let ihl = (buf[0] & 0x0f) as usize;
        if ihl < 5 {
            return Err(PacketError::Invalid("IPv4 IHL below minimum"));
        }
        let header_len = ihl * 4;
        if buf.len() < header_len {
            return Err(PacketError::Truncated);
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < header_len {
            return Err(PacketError::Invalid("IPv4 total length shorter than header"));
        }
        if buf.len() < total_len {
            return Err(PacketError::Truncated);
        }

        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);
        if flags_fragment & 0x1fff != 0 {
            return Err(PacketError::Fragment);
        }

        Ok(Self {
            version: IpVersion::V4,
            header_len,
            total_len,
            protocol: buf[9],
            ttl: buf[8],
            src: IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15])),
            dst: IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])),
        })
    }

    fn parse_v6(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < IPV6_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let total_len = IPV6_HEADER_LEN + payload_len;
        if buf.len() < total_len {
            return Err(PacketError::Truncated);
        }

        let mut src = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&buf[24..40]);

        Ok(Self {
            version: IpVersion::V6,
            header_len: IPV6_HEADER_LEN,
            total_len,
            protocol: buf[6],
            ttl: buf[7],
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
        })
    }
}

/// Writes a fixed IP header (no options / extension headers) at the start of `out`.
///
/// Returns the header length. The IPv4 header checksum is computed here; IPv4 packets carry DF.
pub fn write_ip_header(
    out: &mut [u8],
    src: IpAddr,
    dst: IpAddr,
    protocol: u8,
    identification: u16,
    ttl: u8,
    payload_len: usize,
) -> Result<usize, PacketError> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let total_len = IPV4_HEADER_LEN + payload_len;
            if total_len > u16::MAX as usize {
                return Err(PacketError::PayloadTooLarge(payload_len));
            }
            if out.len() < IPV4_HEADER_LEN {
                return Err(PacketError::BufferTooSmall {
                    need: IPV4_HEADER_LEN,
                    have: out.len(),
                });
            }
            let hdr = &mut out[..IPV4_HEADER_LEN];
            hdr[0] = (4u8 << 4) | 5; // version + IHL
            hdr[1] = 0; // DSCP/ECN
            hdr[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            hdr[4..6].copy_from_slice(&identification.to_be_bytes());
            hdr[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
            hdr[8] = ttl;
            hdr[9] = protocol;
            hdr[10..12].copy_from_slice(&0u16.to_be_bytes());
            hdr[12..16].copy_from_slice(&src.octets());
            hdr[16..20].copy_from_slice(&dst.octets());
            let csum = ipv4_header_checksum(hdr);
            hdr[10..12].copy_from_slice(&csum.to_be_bytes());
            Ok(IPV4_HEADER_LEN)
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            if payload_len > u16::MAX as usize {
                return Err(PacketError::PayloadTooLarge(payload_len));
            }
            if out.len() < IPV6_HEADER_LEN {
                return Err(PacketError::BufferTooSmall {
                    need: IPV6_HEADER_LEN,
                    have: out.len(),
                });
            }
            let hdr = &mut out[..IPV6_HEADER_LEN];
            hdr[0..4].copy_from_slice(&(6u32 << 28).to_be_bytes()); // version, class 0, flow 0
            hdr[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
            hdr[6] = protocol;
            hdr[7] = ttl;
            hdr[8..24].copy_from_slice(&src.octets());
            hdr[24..40].copy_from_slice(&dst.octets());
            Ok(IPV6_HEADER_LEN)
        }
        _ => Err(PacketError::AddressFamilyMismatch),
    }
}
