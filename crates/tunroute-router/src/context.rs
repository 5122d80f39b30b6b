use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{trace, warn};
use tunroute_packet::PacketError;

use crate::metrics::DropReason;
use crate::session::SessionTable;
use crate::{Buffer, BufferPool, Metrics, RouterConfig};

/// State shared by the flow managers and every session task of one router run.
pub(crate) struct RouterContext {
    pub(crate) cfg: Arc<RouterConfig>,
    pub(crate) pool: BufferPool,
    pub(crate) table: Arc<SessionTable>,
    pub(crate) metrics: Metrics,
    /// Synthesized packets waiting for the device writer.
    pub(crate) outbound: mpsc::Sender<Buffer>,
    /// Session tasks; joined on stop.
    pub(crate) tasks: TaskTracker,
    /// Parent of every session's close token.
    pub(crate) flows: CancellationToken,
    ip_ident: AtomicU16,
}

impl RouterContext {
    pub(crate) fn new(
        cfg: Arc<RouterConfig>,
        pool: BufferPool,
        table: Arc<SessionTable>,
        metrics: Metrics,
        outbound: mpsc::Sender<Buffer>,
        flows: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            pool,
            table,
            metrics,
            outbound,
            tasks: TaskTracker::new(),
            flows,
            ip_ident: AtomicU16::new(rand::random()),
        }
    }

    /// IPv4 identification for the next synthesized packet.
    pub(crate) fn next_ident(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed)
    }

    /// Serializes a packet into a pooled buffer. `None` (already counted) if no buffer is free or
    /// the packet cannot be built.
    pub(crate) fn synthesize(
        &self,
        write: impl FnOnce(&mut [u8]) -> Result<usize, PacketError>,
    ) -> Option<Buffer> {
        let mut buf = match self.pool.acquire() {
            Ok(buf) => buf,
            Err(err) => {
                self.metrics.dropped(DropReason::PoolExhausted);
                trace!(%err, "no buffer for synthesized packet");
                return None;
            }
        };
        match buf.fill_with(write) {
            Ok(_) => Some(buf),
            Err(err) => {
                warn!(%err, "failed to build packet");
                None
            }
        }
    }

    /// Queues a packet for the device without waiting; drops it if the queue is full.
    pub(crate) fn try_emit(&self, buf: Buffer) -> bool {
        match self.outbound.try_send(buf) {
            Ok(()) => true,
            Err(_) => {
                self.metrics.dropped(DropReason::OutboundFull);
                false
            }
        }
    }

    /// Queues a packet for the device, waiting for room. `false` once the router is gone.
    pub(crate) async fn emit(&self, buf: Buffer) -> bool {
        self.outbound.send(buf).await.is_ok()
    }
}
