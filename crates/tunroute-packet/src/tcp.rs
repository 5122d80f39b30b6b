use crate::checksum::transport_checksum;
use crate::ip::{write_ip_header, IpVersion, IPPROTO_TCP};
use crate::{PacketError, DEFAULT_TTL};
use core::net::SocketAddr;

pub const TCP_HEADER_LEN: usize = 20;

const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option, only meaningful on SYN segments.
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub fn parse(segment: &[u8]) -> Result<Self, PacketError> {
        if segment.len() < TCP_HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let header_len = ((segment[12] >> 4) as usize) * 4;
        if header_len < TCP_HEADER_LEN {
            return Err(PacketError::Invalid("TCP data offset below minimum"));
        }
        if segment.len() < header_len {
            return Err(PacketError::Truncated);
        }

        Ok(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            header_len,
            flags: TcpFlags::from_bits_truncate(segment[13]),
            window: u16::from_be_bytes([segment[14], segment[15]]),
            mss: parse_mss_option(&segment[TCP_HEADER_LEN..header_len]),
        })
    }
}

fn parse_mss_option(mut opts: &[u8]) -> Option<u16> {
    while let Some(&kind) = opts.first() {
        match kind {
            TCP_OPT_END => return None,
            TCP_OPT_NOP => opts = &opts[1..],
            _ => {
                let len = *opts.get(1)? as usize;
                if len < 2 || len > opts.len() {
                    return None;
                }
                if kind == TCP_OPT_MSS && len == 4 {
                    return Some(u16::from_be_bytes([opts[2], opts[3]]));
                }
                opts = &opts[len..];
            }
        }
    }
    None
}

/// Serializes a complete IP + TCP packet.
///
/// Lengths and both checksums are computed from scratch on every call.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegmentBuilder<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// Emits an MSS option when set (SYN-ACK).
    pub mss: Option<u16>,
    pub identification: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn new(src: SocketAddr, dst: SocketAddr, flags: TcpFlags) -> Self {
        Self {
            src,
            dst,
            seq: 0,
            ack: 0,
            flags,
            window: u16::MAX,
            mss: None,
            identification: 0,
            ttl: DEFAULT_TTL,
            payload: &[],
        }
    }

    fn tcp_header_len(&self) -> usize {
        TCP_HEADER_LEN + if self.mss.is_some() { 4 } else { 0 }
    }

    pub fn packet_len(&self) -> usize {
        IpVersion::of(self.src.ip()).header_len() + self.tcp_header_len() + self.payload.len()
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let total = self.packet_len();
        if out.len() < total {
            return Err(PacketError::BufferTooSmall {
                need: total,
                have: out.len(),
            });
        }
        let tcp_header_len = self.tcp_header_len();
        let segment_len = tcp_header_len + self.payload.len();
        let ip_len = write_ip_header(
            out,
            self.src.ip(),
            self.dst.ip(),
            IPPROTO_TCP,
            self.identification,
            self.ttl,
            segment_len,
        )?;

        let seg = &mut out[ip_len..ip_len + segment_len];
        seg[0..2].copy_from_slice(&self.src.port().to_be_bytes());
        seg[2..4].copy_from_slice(&self.dst.port().to_be_bytes());
        seg[4..8].copy_from_slice(&self.seq.to_be_bytes());
        seg[8..12].copy_from_slice(&self.ack.to_be_bytes());
        seg[12] = ((tcp_header_len / 4) as u8) << 4;
        seg[13] = self.flags.bits();
        seg[14..16].copy_from_slice(&self.window.to_be_bytes());
        seg[16..18].copy_from_slice(&0u16.to_be_bytes());
        seg[18..20].copy_from_slice(&0u16.to_be_bytes()); // urgent ptr
        if let Some(mss) = self.mss {
            seg[20] = TCP_OPT_MSS;
            seg[21] = 4;
            seg[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        seg[tcp_header_len..].copy_from_slice(self.payload);

        let csum = transport_checksum(self.src.ip(), self.dst.ip(), IPPROTO_TCP, seg)
            .ok_or(PacketError::AddressFamilyMismatch)?;
        seg[16..18].copy_from_slice(&csum.to_be_bytes());
        Ok(total)
    }

    pub fn build_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut out = vec![0u8; self.packet_len()];
        self.write(&mut out)?;
        Ok(out)
    }
}
