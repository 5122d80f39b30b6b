//! UDP relay: one connected upstream socket per device flow.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use tunroute_packet::ip::IpVersion;
use tunroute_packet::udp::UDP_HEADER_LEN;
use tunroute_packet::UdpDatagramBuilder;

use crate::context::RouterContext;
use crate::metrics::DropReason;
use crate::session::{Session, SessionCore};
use crate::{FlowKey, Packet};

/// Largest datagram an upstream socket can hand us.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug)]
pub(crate) struct UdpSession {
    core: SessionCore,
    socket: UdpSocket,
}

impl UdpSession {
    pub(crate) fn new(core: SessionCore, socket: UdpSocket) -> Self {
        Self { core, socket }
    }

    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }
}

/// Binds an ephemeral socket of the remote's family and connects it, so only the remote's replies
/// are received.
fn open_socket(remote: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = std::net::UdpSocket::bind(local)?;
    socket.set_nonblocking(true)?;
    socket.connect(remote)?;
    UdpSocket::from_std(socket)
}

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
        handle_datagram(&ctx, &pkt);
    }
    debug!("udp manager stopped");
    rx
}

fn handle_datagram(ctx: &Arc<RouterContext>, pkt: &Packet) {
    let Some(key) = pkt.flow_key() else {
        return;
    };

    let created = ctx.table.get_or_try_create(key, |id| {
        let socket = open_socket(key.remote)?;
        Ok::<_, io::Error>(Session::Udp(Arc::new(UdpSession::new(
            SessionCore::new(key, id, &ctx.flows),
            socket,
        ))))
    });
    let (session, is_new) = match created {
        Ok(created) => created,
        Err(err) => {
            ctx.metrics.udp_open_failed();
            debug!(flow = %key, %err, "failed to open udp socket");
            return;
        }
    };
    let Session::Udp(session) = session else {
        return;
    };

    if is_new {
        ctx.metrics.udp_session_opened();
        debug!(flow = %key, "udp session opened");
        ctx.tasks
            .spawn(relay_responses(Arc::clone(ctx), Arc::clone(&session)));
    }

    session.core().touch();
    match session.socket.try_send(pkt.payload()) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            ctx.metrics.udp_send_failed();
            trace!(flow = %key, "udp socket busy, datagram dropped");
        }
        Err(err) => {
            ctx.metrics.udp_send_failed();
            debug!(flow = %key, %err, "udp send failed");
            session.core().close();
        }
    }
}

/// Remote → device: wraps every datagram received on the session socket into a packet with the
/// flow's addresses swapped.
async fn relay_responses(ctx: Arc<RouterContext>, session: Arc<UdpSession>) {
    let key: FlowKey = session.core().key();
    let max_payload =
        ctx.cfg.mtu - IpVersion::of(key.remote.ip()).header_len() - UDP_HEADER_LEN;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let n = tokio::select! {
            _ = session.core().closed() => break,
            res = session.socket.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(err) => {
                    // Includes ICMP port-unreachable surfacing as ConnectionRefused.
                    debug!(flow = %key, %err, "udp receive failed");
                    break;
                }
            },
        };
        session.core().touch();

        if n > max_payload {
            ctx.metrics.dropped(DropReason::Oversized);
            trace!(flow = %key, len = n, "udp response exceeds mtu, dropped");
            continue;
        }
        let builder = UdpDatagramBuilder {
            identification: ctx.next_ident(),
            ttl: ctx.cfg.ttl,
            ..UdpDatagramBuilder::new(key.remote, key.device, &buf[..n])
        };
        let Some(pkt) = ctx.synthesize(|out| builder.write(out)) else {
            continue;
        };
        let sent = tokio::select! {
            _ = session.core().closed() => break,
            sent = ctx.emit(pkt) => sent,
        };
        if !sent {
            break;
        }
    }

    session.core().close();
    ctx.table.remove(&key, session.core().id());
    ctx.metrics.udp_session_closed();
    debug!(flow = %key, "udp session closed");
}
