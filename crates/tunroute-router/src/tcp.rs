//! TCP relay: terminates the device's connection in a [`Tcb`] and splices the byte stream onto
//! a real upstream socket.
//!
//! One manager task consumes every TCP packet from the device reader and never blocks: replies go
//! out with `try_send`, and data for the upstream socket is handed to the session's own writer
//! task through a bounded queue. Each session runs a driver task that connects upstream, then
//! pumps the socket in both directions until the session closes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tunroute_packet::ip::{IPV4_HEADER_LEN, IPV6_HEADER_LEN};
use tunroute_packet::tcp::TCP_HEADER_LEN;
use tunroute_packet::{TcpFlags, TcpInfo, TcpSegmentBuilder};

use crate::context::RouterContext;
use crate::session::{Session, SessionCore};
use crate::tcb::{Reply, Tcb};
use crate::upstream::{abort_upstream, connect_upstream};
use crate::{Buffer, FlowKey, Packet, RouterConfig};

/// MSS assumed when the device's SYN carries no MSS option.
const DEFAULT_MSS_V4: u16 = 536;
const DEFAULT_MSS_V6: u16 = 1220;

/// Device bytes queued for the upstream socket; `fin` half-closes it after `data` is written.
#[derive(Debug)]
pub(crate) struct Uplink {
    data: Vec<u8>,
    fin: bool,
}

#[derive(Debug)]
pub(crate) struct TcpSession {
    core: SessionCore,
    tcb: Mutex<Tcb>,
    uplink: mpsc::Sender<Uplink>,
    /// Signalled whenever the device acknowledges data or changes its window.
    window: Notify,
    /// Both sides closed gracefully. Unlike `core.closed()`, in-flight uplink data is still
    /// flushed before the session goes away.
    done: CancellationToken,
}

impl TcpSession {
    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }

    /// Never held across an await.
    fn tcb(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn in_handshake(&self) -> bool {
        self.tcb().in_handshake()
    }
}

/// Largest segment payload we can emit towards the device within the MTU.
fn local_mss(cfg: &RouterConfig, remote: SocketAddr) -> u16 {
    let ip_header = match remote {
        SocketAddr::V4(_) => IPV4_HEADER_LEN,
        SocketAddr::V6(_) => IPV6_HEADER_LEN,
    };
    (cfg.mtu - ip_header - TCP_HEADER_LEN).min(u16::MAX as usize) as u16
}

fn downlink_mss(cfg: &RouterConfig, remote: SocketAddr, device_mss: Option<u16>) -> usize {
    let device_mss = device_mss.unwrap_or(match remote {
        SocketAddr::V4(_) => DEFAULT_MSS_V4,
        SocketAddr::V6(_) => DEFAULT_MSS_V6,
    });
    local_mss(cfg, remote).min(device_mss).max(1) as usize
}

/// Segment from the remote endpoint to the device.
fn segment<'a>(
    ctx: &RouterContext,
    key: &FlowKey,
    reply: Reply,
    payload: &'a [u8],
) -> TcpSegmentBuilder<'a> {
    TcpSegmentBuilder {
        seq: reply.seq,
        ack: reply.ack,
        window: ctx.cfg.tcp_window,
        mss: reply
            .flags
            .contains(TcpFlags::SYN)
            .then(|| local_mss(&ctx.cfg, key.remote)),
        identification: ctx.next_ident(),
        ttl: ctx.cfg.ttl,
        payload,
        ..TcpSegmentBuilder::new(key.remote, key.device, reply.flags)
    }
}

/// Sends a payload-less segment without waiting.
fn send_control(ctx: &RouterContext, key: &FlowKey, reply: Reply) -> bool {
    let builder = segment(ctx, key, reply, &[]);
    let Some(buf) = ctx.synthesize(|out| builder.write(out)) else {
        return false;
    };
    let sent = ctx.try_emit(buf);
    if sent && reply.flags.contains(TcpFlags::RST) {
        ctx.metrics.tcp_reset_sent();
    }
    sent
}

/// Consumes TCP packets from the device reader until `cancel` fires, then hands the queue back
/// so the caller can drain it.
pub(crate) async fn run_manager(
    ctx: Arc<RouterContext>,
    mut rx: mpsc::Receiver<Packet>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Packet> {
    loop {
        let pkt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            pkt = rx.recv() => pkt,
        };
        let Some(pkt) = pkt else { break };
        handle_packet(&ctx, &pkt);
    }
    debug!("tcp manager stopped");
    rx
}

fn handle_packet(ctx: &Arc<RouterContext>, pkt: &Packet) {
    let (Some(key), Some(seg)) = (pkt.flow_key(), pkt.tcp()) else {
        return;
    };
    match ctx.table.get(&key) {
        Some(Session::Tcp(session)) => on_device_segment(ctx, &session, &seg, pkt.payload()),
        Some(Session::Udp(_)) => {}
        None if seg.flags.contains(TcpFlags::SYN)
            && !seg.flags.intersects(TcpFlags::ACK | TcpFlags::RST) =>
        {
            open_session(ctx, key, &seg)
        }
        None if seg.flags.contains(TcpFlags::RST) => {}
        None => {
            trace!(flow = %key, flags = ?seg.flags, "segment for unknown connection");
            reset_unknown(ctx, &key, &seg, pkt.payload().len());
        }
    }
}

fn open_session(ctx: &Arc<RouterContext>, key: FlowKey, syn: &TcpInfo) {
    let (uplink_tx, uplink_rx) = mpsc::channel(ctx.cfg.tcp_uplink_queue);
    let (session, created) = ctx
        .table
        .get_or_try_create(key, |id| {
            Ok::<_, Infallible>(Session::Tcp(Arc::new(TcpSession {
                core: SessionCore::new(key, id, &ctx.flows),
                tcb: Mutex::new(Tcb::new(syn, ctx.cfg.tcp_max_reassembly_bytes)),
                uplink: uplink_tx,
                window: Notify::new(),
                done: CancellationToken::new(),
            })))
        })
        .unwrap_or_else(|never| match never {});
    let Session::Tcp(session) = session else {
        return;
    };
    if !created {
        on_device_segment(ctx, &session, syn, &[]);
        return;
    }

    ctx.metrics.tcp_session_opened();
    debug!(flow = %key, "tcp session opened");
    ctx.tasks
        .spawn(drive_session(Arc::clone(ctx), session, uplink_rx));
}

/// RST for a segment that matches no session.
fn reset_unknown(ctx: &RouterContext, key: &FlowKey, seg: &TcpInfo, payload_len: usize) {
    let reply = if seg.flags.contains(TcpFlags::ACK) {
        Reply {
            seq: seg.ack,
            ack: 0,
            flags: TcpFlags::RST,
        }
    } else {
        let mut len = payload_len as u32;
        if seg.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if seg.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        Reply {
            seq: 0,
            ack: seg.seq.wrapping_add(len),
            flags: TcpFlags::RST | TcpFlags::ACK,
        }
    };
    send_control(ctx, key, reply);
}

fn on_device_segment(ctx: &RouterContext, session: &TcpSession, seg: &TcpInfo, payload: &[u8]) {
    let key = session.core().key();
    session.core().touch();

    let needs_uplink = !payload.is_empty() || seg.flags.contains(TcpFlags::FIN);
    let permit = if needs_uplink {
        session.uplink.try_reserve().ok()
    } else {
        None
    };
    let outcome = session.tcb().on_segment(seg, payload, permit.is_some());

    if outcome.reset {
        debug!(flow = %key, "connection reset by device");
        session.core().close();
        return;
    }
    if let Some(permit) = permit {
        if !outcome.deliver.is_empty() || outcome.shutdown_upstream {
            permit.send(Uplink {
                data: outcome.deliver,
                fin: outcome.shutdown_upstream,
            });
        }
    }
    if outcome.window_update {
        session.window.notify_one();
    }
    if let Some(reply) = outcome.reply {
        send_control(ctx, &key, reply);
    }
    if outcome.finished {
        trace!(flow = %key, "both directions closed");
        session.done.cancel();
    }
}

/// Lifetime of one session: connect upstream, relay until closed, then clean up.
async fn drive_session(
    ctx: Arc<RouterContext>,
    session: Arc<TcpSession>,
    uplink: mpsc::Receiver<Uplink>,
) {
    let key = session.core().key();
    let connected = tokio::select! {
        _ = session.core().closed() => None,
        res = connect_upstream(key.remote, ctx.cfg.tcp_connect_timeout) => match res {
            Ok(stream) => Some(stream),
            Err(err) => {
                ctx.metrics.tcp_connect_failed();
                debug!(flow = %key, %err, "upstream connect failed");
                None
            }
        },
    };

    if let Some(stream) = connected {
        let synack = session.tcb().on_connected(rand::random());
        if let Some(synack) = synack {
            send_control(&ctx, &key, synack);
            let (mut reader, mut writer) = stream.into_split();
            tokio::join!(
                downlink(&ctx, &session, &mut reader),
                uplink_writer(&ctx, &session, &mut writer, uplink),
            );
            // Both socket directions are done; linger until the device finishes or the session
            // is evicted.
            tokio::select! {
                _ = session.core().closed() => {}
                _ = session.done.cancelled() => {}
            }
            if finish(&ctx, &session) {
                if let Err(err) = abort_upstream(reader, writer) {
                    debug!(flow = %key, %err, "failed to reset upstream");
                }
            }
            return;
        }
    }

    finish(&ctx, &session);
}

/// Tears the session down, resetting the device side unless it already ended. Returns whether
/// the connection was aborted rather than closed by both ends.
fn finish(ctx: &RouterContext, session: &TcpSession) -> bool {
    let key = session.core().key();
    let (reset, device_reset) = {
        let mut tcb = session.tcb();
        (tcb.take_reset(), tcb.device_reset())
    };
    if let Some(reply) = reset {
        send_control(ctx, &key, reply);
    }
    session.core().close();
    ctx.table.remove(&key, session.core().id());
    ctx.metrics.tcp_session_closed();
    debug!(flow = %key, reset = reset.is_some(), device_reset, "tcp session closed");
    reset.is_some() || device_reset
}

async fn wait_for_window(session: &TcpSession) -> Option<usize> {
    loop {
        let window = session.tcb().send_window();
        if window > 0 {
            return Some(window);
        }
        tokio::select! {
            _ = session.core().closed() => return None,
            _ = session.window.notified() => {}
        }
    }
}

/// Waits for a pooled buffer, backing off while the pool is exhausted.
async fn acquire_buffer(ctx: &RouterContext, session: &TcpSession) -> Option<Buffer> {
    loop {
        if let Ok(buf) = ctx.pool.acquire() {
            return Some(buf);
        }
        tokio::select! {
            _ = session.core().closed() => return None,
            _ = tokio::time::sleep(ctx.cfg.reader_idle_backoff) => {}
        }
    }
}

/// Remote → device: reads the upstream socket and emits MSS-sized segments within the device's
/// window. Sends our FIN on EOF.
async fn downlink(ctx: &RouterContext, session: &TcpSession, reader: &mut OwnedReadHalf) {
    let key = session.core().key();
    let mss = downlink_mss(&ctx.cfg, key.remote, session.tcb().device_mss());
    let mut buf = vec![0u8; ctx.cfg.tcp_read_chunk];

    loop {
        let Some(window) = wait_for_window(session).await else {
            return;
        };
        let limit = window.min(buf.len());
        let n = tokio::select! {
            _ = session.core().closed() => return,
            res = reader.read(&mut buf[..limit]) => match res {
                Ok(n) => n,
                Err(err) => {
                    debug!(flow = %key, %err, "upstream read failed");
                    session.core().close();
                    return;
                }
            },
        };

        if n == 0 {
            let fin = session.tcb().on_remote_eof();
            if let Some(fin) = fin {
                trace!(flow = %key, "upstream closed");
                let builder = segment(ctx, &key, fin, &[]);
                if let Some(pkt) = ctx.synthesize(|out| builder.write(out)) {
                    tokio::select! {
                        _ = session.core().closed() => {}
                        _ = ctx.emit(pkt) => {}
                    }
                }
            }
            return;
        }

        session.core().touch();
        ctx.metrics.tcp_downlink(n);
        for chunk in buf[..n].chunks(mss) {
            let Some(mut pkt) = acquire_buffer(ctx, session).await else {
                return;
            };
            let reply = session.tcb().next_data(chunk.len());
            let builder = segment(ctx, &key, reply, chunk);
            if pkt.fill_with(|out| builder.write(out)).is_err() {
                session.core().close();
                return;
            }
            let sent = tokio::select! {
                _ = session.core().closed() => false,
                sent = ctx.emit(pkt) => sent,
            };
            if !sent {
                return;
            }
        }
    }
}

/// Device → remote: writes reassembled device data to the upstream socket in order.
async fn uplink_writer(
    ctx: &RouterContext,
    session: &TcpSession,
    writer: &mut OwnedWriteHalf,
    mut rx: mpsc::Receiver<Uplink>,
) {
    let key = session.core().key();
    loop {
        let msg = tokio::select! {
            _ = session.core().closed() => return,
            msg = rx.recv() => msg,
        };
        let Some(Uplink { data, fin }) = msg else {
            return;
        };

        if !data.is_empty() {
            let res = tokio::select! {
                _ = session.core().closed() => return,
                res = writer.write_all(&data) => res,
            };
            if let Err(err) = res {
                debug!(flow = %key, %err, "upstream write failed");
                session.core().close();
                return;
            }
            ctx.metrics.tcp_uplink(data.len());
        }

        if fin {
            if let Err(err) = writer.shutdown().await {
                debug!(flow = %key, %err, "upstream shutdown failed");
                session.core().close();
            }
            return;
        }
    }
}
