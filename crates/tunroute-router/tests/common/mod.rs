#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tunroute_packet::{PacketView, TcpFlags, TcpInfo, TcpSegmentBuilder, UdpDatagramBuilder};
use tunroute_router::{PacketRouter, RouterConfig, Tunnel};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory tun device: tests inject packets the "device" sends and observe what the router
/// writes back.
pub struct TestTunnel {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    broken: AtomicBool,
}

impl Tunnel for TestTunnel {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"));
        }
        let Some(pkt) = self.inbound.lock().unwrap().pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = pkt.len().min(buf.len());
        buf[..n].copy_from_slice(&pkt[..n]);
        Ok(n)
    }

    fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let _ = self.outbound.send(packet.to_vec());
        Ok(packet.len())
    }
}

/// A packet written by the router to the device.
pub struct Captured {
    pub bytes: Vec<u8>,
    pub view: PacketView,
}

impl Captured {
    pub fn payload(&self) -> &[u8] {
        self.view.payload(&self.bytes)
    }

    pub fn tcp(&self) -> TcpInfo {
        self.view.tcp.expect("not a tcp packet")
    }

    pub fn has_flags(&self, flags: TcpFlags) -> bool {
        self.view.tcp.map_or(false, |tcp| tcp.flags == flags)
    }
}

pub struct Device {
    tunnel: Arc<TestTunnel>,
    from_router: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Device {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tunnel: Arc::new(TestTunnel {
                inbound: Mutex::new(VecDeque::new()),
                outbound: tx,
                broken: AtomicBool::new(false),
            }),
            from_router: rx,
        }
    }

    pub fn tunnel(&self) -> Arc<TestTunnel> {
        Arc::clone(&self.tunnel)
    }

    pub fn inject(&self, pkt: Vec<u8>) {
        self.tunnel.inbound.lock().unwrap().push_back(pkt);
    }

    pub fn break_reads(&self) {
        self.tunnel.broken.store(true, Ordering::SeqCst);
    }

    pub async fn next_packet(&mut self) -> Captured {
        let bytes = tokio::time::timeout(RECV_TIMEOUT, self.from_router.recv())
            .await
            .expect("timed out waiting for a packet from the router")
            .expect("router tunnel closed");
        let view = PacketView::parse(&bytes).expect("router emitted a malformed packet");
        assert!(view.transport_checksum_ok(&bytes), "bad checksum on {view:?}");
        Captured { bytes, view }
    }

    /// Skips packets until one matches.
    pub async fn expect(&mut self, mut pred: impl FnMut(&Captured) -> bool) -> Captured {
        loop {
            let pkt = self.next_packet().await;
            if pred(&pkt) {
                return pkt;
            }
        }
    }

    /// Asserts nothing is written to the device for `dur`.
    pub async fn expect_silence(&mut self, dur: Duration) {
        if let Ok(Some(bytes)) = tokio::time::timeout(dur, self.from_router.recv()).await {
            panic!("unexpected packet: {:?}", PacketView::parse(&bytes));
        }
    }
}

pub fn test_config() -> RouterConfig {
    RouterConfig {
        reader_idle_backoff: Duration::from_millis(1),
        sweep_interval: Duration::from_millis(50),
        tcp_connect_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

pub fn start_router(cfg: RouterConfig, device: &Device) -> PacketRouter {
    let router = PacketRouter::new(cfg).unwrap();
    router.start(device.tunnel()).unwrap();
    router
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn udp(device: SocketAddr, remote: SocketAddr, payload: &[u8]) -> Vec<u8> {
    UdpDatagramBuilder::new(device, remote, payload)
        .build_vec()
        .unwrap()
}

/// Device-side view of one TCP connection, tracking the sequence numbers it would use.
pub struct TcpClient {
    pub device: SocketAddr,
    pub remote: SocketAddr,
    pub seq: u32,
    pub ack: u32,
}

impl TcpClient {
    pub fn new(device: SocketAddr, remote: SocketAddr, isn: u32) -> Self {
        Self {
            device,
            remote,
            seq: isn,
            ack: 0,
        }
    }

    pub fn segment_at(&self, seq: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        TcpSegmentBuilder {
            seq,
            ack: self.ack,
            payload,
            ..TcpSegmentBuilder::new(self.device, self.remote, flags)
        }
        .build_vec()
        .unwrap()
    }

    pub fn syn(&self) -> Vec<u8> {
        TcpSegmentBuilder {
            seq: self.seq,
            mss: Some(1400),
            ..TcpSegmentBuilder::new(self.device, self.remote, TcpFlags::SYN)
        }
        .build_vec()
        .unwrap()
    }

    /// Sends data at the current sequence number and advances it.
    pub fn data(&mut self, payload: &[u8]) -> Vec<u8> {
        let pkt = self.segment_at(self.seq, TcpFlags::ACK | TcpFlags::PSH, payload);
        self.seq = self.seq.wrapping_add(payload.len() as u32);
        pkt
    }

    pub fn ack_segment(&self) -> Vec<u8> {
        self.segment_at(self.seq, TcpFlags::ACK, &[])
    }

    pub fn fin(&mut self) -> Vec<u8> {
        let pkt = self.segment_at(self.seq, TcpFlags::FIN | TcpFlags::ACK, &[]);
        self.seq = self.seq.wrapping_add(1);
        pkt
    }

    /// Runs the three-way handshake against the router, returning the SYN-ACK.
    pub async fn connect(&mut self, device: &mut Device) -> Captured {
        device.inject(self.syn());
        let synack = device
            .expect(|p| p.has_flags(TcpFlags::SYN | TcpFlags::ACK))
            .await;
        self.seq = self.seq.wrapping_add(1);
        self.ack = synack.tcp().seq.wrapping_add(1);
        device.inject(self.ack_segment());
        synack
    }
}

pub fn device_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 2], port))
}
