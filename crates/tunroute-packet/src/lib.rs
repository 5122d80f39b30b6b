#![forbid(unsafe_code)]

//! Raw IP packet parsing and building for the tunnel router.
//!
//! Everything here works on plain byte slices: a tun device hands us IPv4/IPv6 packets with no
//! link-layer framing, and everything we send back must be a complete IP packet with freshly
//! computed lengths and checksums.
//!
//! - [`PacketView::parse`] classifies an inbound packet once, recording addresses, ports and
//!   offsets so downstream code never re-inspects the header bytes.
//! - [`TcpSegmentBuilder`] / [`UdpDatagramBuilder`] serialize a full IP packet into a caller
//!   supplied buffer (typically a pooled one).

pub mod checksum;
pub mod ip;
pub mod tcp;
pub mod udp;
mod error;
mod view;

pub use error::PacketError;
pub use ip::{IpVersion, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};
pub use tcp::{TcpFlags, TcpSegmentBuilder};
pub use udp::UdpDatagramBuilder;
pub use view::{PacketView, Protocol, TcpInfo};

/// Default IP TTL / hop limit used for synthesized packets.
pub const DEFAULT_TTL: u8 = 64;
