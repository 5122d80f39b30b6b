use crate::checksum::transport_checksum;
use crate::ip::{write_ip_header, IpVersion, IPPROTO_UDP};
use crate::{PacketError, DEFAULT_TTL};
use core::net::SocketAddr;

pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header plus payload, as declared by the header.
    pub length: usize,
}

impl UdpHeader {
    pub fn parse(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < UDP_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let length = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
        if length < UDP_HEADER_LEN {
            return Err(PacketError::Invalid("UDP length shorter than header"));
        }
        if datagram.len() < length {
            return Err(PacketError::Truncated);
        }
        Ok(Self {
            src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
            dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
            length,
        })
    }
}

/// Serializes a complete IP + UDP packet with freshly computed checksums.
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagramBuilder<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub identification: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagramBuilder<'a> {
    pub fn new(src: SocketAddr, dst: SocketAddr, payload: &'a [u8]) -> Self {
        Self {
            src,
            dst,
            identification: 0,
            ttl: DEFAULT_TTL,
            payload,
        }
    }

    pub fn packet_len(&self) -> usize {
        IpVersion::of(self.src.ip()).header_len() + UDP_HEADER_LEN + self.payload.len()
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let total = self.packet_len();
        if out.len() < total {
            return Err(PacketError::BufferTooSmall {
                need: total,
                have: out.len(),
            });
        }
        let udp_len = UDP_HEADER_LEN + self.payload.len();
        if udp_len > u16::MAX as usize {
            return Err(PacketError::PayloadTooLarge(self.payload.len()));
        }
        let ip_len = write_ip_header(
            out,
            self.src.ip(),
            self.dst.ip(),
            IPPROTO_UDP,
            self.identification,
            self.ttl,
            udp_len,
        )?;

        let dgram = &mut out[ip_len..ip_len + udp_len];
        dgram[0..2].copy_from_slice(&self.src.port().to_be_bytes());
        dgram[2..4].copy_from_slice(&self.dst.port().to_be_bytes());
        dgram[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
        dgram[6..8].copy_from_slice(&0u16.to_be_bytes());
        dgram[UDP_HEADER_LEN..].copy_from_slice(self.payload);

        let csum = transport_checksum(self.src.ip(), self.dst.ip(), IPPROTO_UDP, dgram)
            .ok_or(PacketError::AddressFamilyMismatch)?;
        // A computed zero is transmitted as all ones (zero means "no checksum" on IPv4 and is
        // illegal on IPv6).
        let csum = if csum == 0 { 0xffff } else { csum };
        dgram[6..8].copy_from_slice(&csum.to_be_bytes());
        Ok(total)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut out = vec![0u8; self.packet_len()];
        self.write(&mut out)?;
        Ok(out)
    }
}
