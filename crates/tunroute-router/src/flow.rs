use std::fmt;
use std::net::SocketAddr;

use tunroute_packet::{PacketError, PacketView, Protocol, TcpInfo};

use crate::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        })
    }
}

/// Identity of one relayed connection: the device-side endpoint and the remote it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub transport: Transport,
    pub device: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    /// Key of the flow an inbound (device → remote) packet belongs to. `None` for protocols that
    /// are not relayed.
    pub fn of(view: &PacketView) -> Option<Self> {
        let transport = match view.protocol {
            Protocol::Tcp => Transport::Tcp,
            Protocol::Udp => Transport::Udp,
            Protocol::Icmp | Protocol::Other(_) => return None,
        };
        Some(Self {
            transport,
            device: view.source_addr(),
            remote: view.destination_addr(),
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.transport, self.device, self.remote)
    }
}

/// A classified inbound packet: the pooled buffer plus the view parsed from it.
///
/// Dropping the packet returns the buffer to its pool.
#[derive(Debug)]
pub struct Packet {
    buf: Buffer,
    view: PacketView,
}

impl Packet {
    pub fn parse(buf: Buffer) -> Result<Self, PacketError> {
        let view = PacketView::parse(&buf)?;
        Ok(Self { buf, view })
    }

    pub fn view(&self) -> &PacketView {
        &self.view
    }

    pub fn flow_key(&self) -> Option<FlowKey> {
        FlowKey::of(&self.view)
    }

    pub fn tcp(&self) -> Option<TcpInfo> {
        self.view.tcp
    }

    pub fn payload(&self) -> &[u8] {
        self.view.payload(&self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
