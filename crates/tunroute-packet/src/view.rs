use crate::checksum::{checksum_pseudo_header, finalize_checksum, sum_words};
use crate::ip::{IpHeader, IpVersion, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};
use crate::tcp::{TcpFlags, TcpHeader};
use crate::udp::{UdpHeader, UDP_HEADER_LEN};
use crate::PacketError;
use core::fmt;
use core::net::{IpAddr, SocketAddr};

/// Transport protocol tag, decoded once by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    /// ICMPv4 or ICMPv6.
    Icmp,
    Other(u8),
}

impl Protocol {
    fn from_number(version: IpVersion, number: u8) -> Self {
        match (version, number) {
            (_, IPPROTO_TCP) => Protocol::Tcp,
            (_, IPPROTO_UDP) => Protocol::Udp,
            (IpVersion::V4, IPPROTO_ICMP) | (IpVersion::V6, IPPROTO_ICMPV6) => Protocol::Icmp,
            (_, other) => Protocol::Other(other),
        }
    }

    pub fn number(self, version: IpVersion) -> u8 {
        match (self, version) {
            (Protocol::Tcp, _) => IPPROTO_TCP,
            (Protocol::Udp, _) => IPPROTO_UDP,
            (Protocol::Icmp, IpVersion::V4) => IPPROTO_ICMP,
            (Protocol::Icmp, IpVersion::V6) => IPPROTO_ICMPV6,
            (Protocol::Other(n), _) => n,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Icmp => f.write_str("icmp"),
            Protocol::Other(n) => write!(f, "ip-proto-{n}"),
        }
    }
}

/// TCP-specific fields of a [`PacketView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
}

/// Parsed overlay of one inbound IP packet.
///
/// The view stores offsets rather than borrowing, so it can travel next to the buffer it was
/// parsed from; it is only meaningful for that buffer's unmodified contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketView {
    pub version: IpVersion,
    pub protocol: Protocol,
    pub source: IpAddr,
    pub destination: IpAddr,
    /// Zero for protocols without ports.
    pub source_port: u16,
    pub destination_port: u16,
    /// IP header length (including IPv4 options).
    pub header_len: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Declared packet length (trailing padding excluded).
    pub packet_len: usize,
    pub tcp: Option<TcpInfo>,
}

impl PacketView {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        let ip = IpHeader::parse(buf)?;
        let transport = &buf[ip.header_len..ip.total_len];
        let protocol = Protocol::from_number(ip.version, ip.protocol);

        let mut view = Self {
            version: ip.version,
            protocol,
            source: ip.src,
            destination: ip.dst,
            source_port: 0,
            destination_port: 0,
            header_len: ip.header_len,
            payload_offset: ip.header_len,
            payload_len: transport.len(),
            packet_len: ip.total_len,
            tcp: None,
        };

        match protocol {
            Protocol::Tcp => {
                let tcp = TcpHeader::parse(transport)?;
                view.source_port = tcp.src_port;
                view.destination_port = tcp.dst_port;
                view.payload_offset = ip.header_len + tcp.header_len;
                view.payload_len = transport.len() - tcp.header_len;
                view.tcp = Some(TcpInfo {
                    seq: tcp.seq,
                    ack: tcp.ack,
                    flags: tcp.flags,
                    window: tcp.window,
                    mss: tcp.mss,
                });
            }
            Protocol::Udp => {
                let udp = UdpHeader::parse(transport)?;
                view.source_port = udp.src_port;
                view.destination_port = udp.dst_port;
                view.payload_offset = ip.header_len + UDP_HEADER_LEN;
                view.payload_len = udp.length - UDP_HEADER_LEN;
            }
            Protocol::Icmp | Protocol::Other(_) => {}
        }

        Ok(view)
    }

    pub fn source_addr(&self) -> SocketAddr {
        SocketAddr::new(self.source, self.source_port)
    }

    pub fn destination_addr(&self) -> SocketAddr {
        SocketAddr::new(self.destination, self.destination_port)
    }

    /// Transport payload of the packet this view was parsed from.
    ///
    /// Returns an empty slice if `buf` is shorter than the parsed layout.
    pub fn payload<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        buf.get(self.payload_offset..self.payload_offset + self.payload_len)
            .unwrap_or(&[])
    }

    /// Verifies the TCP/UDP checksum of the packet this view was parsed from.
    ///
    /// Protocols without a pseudo-header checksum report `true`; an all-zero IPv4 UDP checksum
    /// (checksum disabled) is accepted.
    pub fn transport_checksum_ok(&self, buf: &[u8]) -> bool {
        let Some(segment) = buf.get(self.header_len..self.packet_len) else {
            return false;
        };
        match self.protocol {
            Protocol::Tcp => {}
            Protocol::Udp => {
                if self.version == IpVersion::V4 && segment.get(6..8) == Some(&[0u8, 0][..]) {
                    return true;
                }
            }
            Protocol::Icmp | Protocol::Other(_) => return true,
        }
        let Some(pseudo) = checksum_pseudo_header(
            self.source,
            self.destination,
            self.protocol.number(self.version),
            segment.len(),
        ) else {
            return false;
        };
        finalize_checksum(sum_words(pseudo, segment)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TcpSegmentBuilder, UdpDatagramBuilder};

    #[test]
    fn classifies_tcp_with_offsets() {
        let src: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let dst: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let pkt = TcpSegmentBuilder {
            seq: 77,
            ack: 0,
            mss: Some(1400),
            payload: b"",
            ..TcpSegmentBuilder::new(src, dst, TcpFlags::SYN)
        }
        .build_vec()
        .unwrap();

        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.protocol, Protocol::Tcp);
        assert_eq!(view.source_addr(), src);
        assert_eq!(view.destination_addr(), dst);
        assert_eq!(view.header_len, 20);
        assert_eq!(view.payload_offset, 44);
        assert_eq!(view.payload_len, 0);
        let tcp = view.tcp.unwrap();
        assert_eq!(tcp.seq, 77);
        assert_eq!(tcp.flags, TcpFlags::SYN);
        assert_eq!(tcp.mss, Some(1400));
        assert!(view.transport_checksum_ok(&pkt));
    }

    #[test]
    fn classifies_udp_payload() {
        let src: SocketAddr = "10.0.0.2:5353".parse().unwrap();
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let pkt = UdpDatagramBuilder::new(src, dst, b"query").build_vec().unwrap();
        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.protocol, Protocol::Udp);
        assert_eq!(view.payload(&pkt), b"query");
        assert!(view.tcp.is_none());
        assert!(view.transport_checksum_ok(&pkt));
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let src: SocketAddr = "10.0.0.2:5353".parse().unwrap();
        let dst: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let mut pkt = UdpDatagramBuilder::new(src, dst, b"query").build_vec().unwrap();
        let last = pkt.len() - 1;
        pkt[last] ^= 0xff;
        let view = PacketView::parse(&pkt).unwrap();
        assert!(!view.transport_checksum_ok(&pkt));
    }

    #[test]
    fn icmp_and_other_have_no_ports() {
        let mut pkt = UdpDatagramBuilder::new(
            "10.0.0.2:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
            b"ping",
        )
        .build_vec()
        .unwrap();
        pkt[9] = IPPROTO_ICMP;
        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.protocol, Protocol::Icmp);
        assert_eq!(view.source_port, 0);

        pkt[9] = 47; // GRE
        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.protocol, Protocol::Other(47));
        assert_eq!(view.protocol.to_string(), "ip-proto-47");
    }

    #[test]
    fn truncated_transport_header_fails() {
        let pkt = UdpDatagramBuilder::new(
            "10.0.0.2:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
            b"",
        )
        .build_vec()
        .unwrap();
        // Shrink the declared IP length so the UDP header no longer fits.
        let mut short = pkt[..24].to_vec();
        short[2..4].copy_from_slice(&24u16.to_be_bytes());
        assert_eq!(PacketView::parse(&short), Err(PacketError::Truncated));
    }
}
