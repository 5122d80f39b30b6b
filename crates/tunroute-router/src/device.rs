//! The tun side of the router: one thread reading packets off the device and one thread writing
//! synthesized packets back.
//!
//! Both threads do blocking I/O on the [`Tunnel`] and poll their cancellation token between
//! operations, so the tunnel should be opened non-blocking: an empty read then returns promptly
//! (`Ok(0)` or `WouldBlock`) and the reader backs off briefly instead of parking in the kernel.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tunroute_packet::Protocol;

use crate::context::RouterContext;
use crate::metrics::DropReason;
use crate::{Buffer, Metrics, Packet, RouterError};

/// Pause before retrying a write the device could not take yet.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// A packet-oriented device: every `recv` yields one whole IP packet and every `send` takes one.
pub trait Tunnel: Send + Sync + 'static {
    /// Reads one packet into `buf`. `Ok(0)` or `WouldBlock` means nothing is pending.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// A tun file descriptor (e.g. `/dev/net/tun` after `TUNSETIFF`, or one handed over by a VPN API).
impl Tunnel for File {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, packet: &[u8]) -> io::Result<usize> {
        (&*self).write(packet)
    }
}

impl<T: Tunnel + ?Sized> Tunnel for Arc<T> {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).recv(buf)
    }

    fn send(&self, packet: &[u8]) -> io::Result<usize> {
        (**self).send(packet)
    }
}

pub(crate) struct DeviceReader<T> {
    pub(crate) tunnel: Arc<T>,
    pub(crate) ctx: Arc<RouterContext>,
    pub(crate) tcp: mpsc::Sender<Packet>,
    pub(crate) udp: mpsc::Sender<Packet>,
    pub(crate) cancel: CancellationToken,
}

impl<T: Tunnel> DeviceReader<T> {
    pub(crate) fn run(self) -> Result<(), RouterError> {
        let backoff = self.ctx.cfg.reader_idle_backoff;
        // Reads that arrive while the pool is exhausted land here and are discarded.
        let mut scratch: Vec<u8> = Vec::new();

        while !self.cancel.is_cancelled() {
            let mut buf = self.ctx.pool.acquire().ok();
            let target = match buf.as_mut() {
                Some(buf) => buf.spare_mut(),
                None => {
                    scratch.resize(self.ctx.pool.buffer_size(), 0);
                    &mut scratch[..]
                }
            };

            let n = match self.tunnel.recv(target) {
                Ok(0) => {
                    std::thread::sleep(backoff);
                    continue;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(backoff);
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(RouterError::TunnelRead(err)),
            };
            self.ctx.metrics.packet_from_device(n);

            let Some(mut buf) = buf else {
                self.ctx.metrics.dropped(DropReason::PoolExhausted);
                trace!(len = n, "buffer pool exhausted, packet dropped");
                continue;
            };
            buf.set_len(n);
            match Packet::parse(buf) {
                Ok(pkt) => self.dispatch(pkt),
                Err(err) => {
                    self.ctx.metrics.dropped(DropReason::Malformed);
                    trace!(%err, len = n, "malformed packet dropped");
                }
            }
        }

        debug!("device reader stopped");
        Ok(())
    }

    /// Routes a packet to its flow manager without blocking.
    pub(crate) fn dispatch(&self, pkt: Packet) {
        let queue = match pkt.view().protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
            other => {
                self.ctx.metrics.dropped(DropReason::Unsupported);
                trace!(protocol = %other, "unsupported protocol dropped");
                return;
            }
        };

        // Keep headroom for flows that already have a session.
        let is_new = pkt.flow_key().map_or(true, |key| !self.ctx.table.contains(&key));
        if is_new && queue.capacity() <= self.ctx.cfg.new_flow_reserve() {
            self.ctx.metrics.dropped(DropReason::QueueFull);
            trace!("queue above new-flow watermark, packet dropped");
            return;
        }

        match queue.try_send(pkt) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.ctx.metrics.dropped(DropReason::QueueFull);
            }
        }
    }
}

pub(crate) struct DeviceWriter<T> {
    pub(crate) tunnel: Arc<T>,
    pub(crate) rx: mpsc::Receiver<Buffer>,
    pub(crate) metrics: Metrics,
    pub(crate) runtime: Handle,
    pub(crate) cancel: CancellationToken,
}

impl<T: Tunnel> DeviceWriter<T> {
    /// Writes queued packets until cancelled. The queue is handed back so undelivered packets can
    /// be released by the caller.
    pub(crate) fn run(mut self) -> (mpsc::Receiver<Buffer>, Result<(), RouterError>) {
        let result = self.write_loop();
        debug!("device writer stopped");
        (self.rx, result)
    }

    fn write_loop(&mut self) -> Result<(), RouterError> {
        loop {
            let cancel = &self.cancel;
            let rx = &mut self.rx;
            let next = self.runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    buf = rx.recv() => buf,
                }
            });
            let Some(buf) = next else {
                return Ok(());
            };
            write_packet(&*self.tunnel, &buf, &self.cancel).map_err(RouterError::TunnelWrite)?;
            self.metrics.packet_to_device(buf.len());
        }
    }
}

/// Writes one whole packet, retrying short and would-block writes.
fn write_packet<T: Tunnel + ?Sized>(
    tunnel: &T,
    packet: &[u8],
    cancel: &CancellationToken,
) -> io::Result<()> {
    let mut written = 0;
    while written < packet.len() {
        match tunnel.send(&packet[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                std::thread::sleep(WRITE_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
