//! Per-connection TCP bookkeeping, free of I/O.
//!
//! The device side of every relayed connection is terminated here: the [`Tcb`] tracks both
//! sequence spaces, reassembles device data into a byte stream and decides which segment (if
//! any) must be sent back. The caller owns the sockets and serializes the returned [`Reply`].

use std::collections::BTreeMap;

use tunroute_packet::{TcpFlags, TcpInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    /// SYN seen; the upstream connect is in progress.
    Connecting,
    /// SYN-ACK sent; waiting for the device to acknowledge it.
    SynReceived,
    Established,
    /// The device sent FIN; the remote may still be sending.
    FinWait,
    /// Our FIN has been sent; waiting for the device to finish.
    Closing,
    Closed,
}

/// Header fields of a segment to be synthesized towards the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reply {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
}

/// Result of feeding one device segment to [`Tcb::on_segment`].
#[derive(Debug, Default)]
pub(crate) struct Outcome {
    /// Newly in-order bytes to write upstream.
    pub deliver: Vec<u8>,
    /// The device half-closed: shut down the upstream write side after `deliver`.
    pub shutdown_upstream: bool,
    pub reply: Option<Reply>,
    /// `snd_una` advanced or the device window changed.
    pub window_update: bool,
    pub reset: bool,
    /// Both directions are done; the session can go.
    pub finished: bool,
}

#[derive(Debug)]
pub(crate) struct Tcb {
    state: TcpState,

    device_isn: u32,
    rcv_nxt: u32,
    /// Stream bytes delivered so far; reassembly keys are offsets in this space.
    delivered: u64,
    reassembly: BTreeMap<u64, Vec<u8>>,
    reassembly_bytes: usize,
    max_reassembly: usize,

    our_isn: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    device_mss: Option<u16>,

    device_fin: bool,
    fin_seq: Option<u32>,
    fin_acked: bool,
    /// The device aborted the connection with an RST.
    device_reset: bool,
}

impl Tcb {
    pub(crate) fn new(syn: &TcpInfo, max_reassembly: usize) -> Self {
        Self {
            state: TcpState::Connecting,
            device_isn: syn.seq,
            rcv_nxt: syn.seq.wrapping_add(1),
            delivered: 0,
            reassembly: BTreeMap::new(),
            reassembly_bytes: 0,
            max_reassembly,
            our_isn: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: syn.window as u32,
            device_mss: syn.mss,
            device_fin: false,
            fin_seq: None,
            fin_acked: false,
            device_reset: false,
        }
    }

    pub(crate) fn state(&self) -> TcpState {
        self.state
    }

    pub(crate) fn device_mss(&self) -> Option<u16> {
        self.device_mss
    }

    pub(crate) fn device_reset(&self) -> bool {
        self.device_reset
    }

    pub(crate) fn in_handshake(&self) -> bool {
        matches!(self.state, TcpState::Connecting | TcpState::SynReceived)
    }

    /// The upstream connect succeeded; returns the SYN-ACK to send. `None` if the device gave
    /// up on the connection meanwhile.
    pub(crate) fn on_connected(&mut self, isn: u32) -> Option<Reply> {
        if self.state != TcpState::Connecting {
            return None;
        }
        self.our_isn = isn;
        self.snd_una = isn;
        self.snd_nxt = isn.wrapping_add(1);
        self.state = TcpState::SynReceived;
        Some(self.syn_ack())
    }

    fn syn_ack(&self) -> Reply {
        Reply {
            seq: self.our_isn,
            ack: self.rcv_nxt,
            flags: TcpFlags::SYN | TcpFlags::ACK,
        }
    }

    fn ack(&self) -> Reply {
        Reply {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::ACK,
        }
    }

    /// Processes one segment from the device.
    ///
    /// `can_deliver` is false when the upstream queue has no room; in-order data or FIN is then
    /// neither accepted nor acknowledged, so the device retransmits it later.
    pub(crate) fn on_segment(&mut self, seg: &TcpInfo, payload: &[u8], can_deliver: bool) -> Outcome {
        let mut out = Outcome::default();
        let flags = seg.flags;

        if flags.contains(TcpFlags::RST) {
            if self.state != TcpState::Closed {
                self.state = TcpState::Closed;
                self.device_reset = true;
                out.reset = true;
            }
            return out;
        }
        if matches!(self.state, TcpState::Connecting | TcpState::Closed) {
            return out;
        }
        if flags.contains(TcpFlags::SYN) {
            // Our SYN-ACK was lost; the device is retrying.
            if self.state == TcpState::SynReceived && seg.seq == self.device_isn {
                out.reply = Some(self.syn_ack());
            }
            return out;
        }
        if !flags.contains(TcpFlags::ACK) {
            return out;
        }

        self.on_ack(seg.ack, seg.window, &mut out);
        if self.state == TcpState::SynReceived {
            return out;
        }

        let fin = flags.contains(TcpFlags::FIN);
        if payload.is_empty() && !fin {
            self.check_finished(&mut out);
            return out;
        }
        if self.device_fin {
            out.reply = Some(self.ack());
            self.check_finished(&mut out);
            return out;
        }

        let offset = seg.seq.wrapping_sub(self.rcv_nxt) as i32;
        if offset > 0 {
            self.buffer_out_of_order(offset as usize, payload);
            out.reply = Some(self.ack());
            return out;
        }

        let skip = offset.unsigned_abs() as usize;
        if skip > payload.len() || (skip == payload.len() && !fin) {
            // Entirely old; re-acknowledge so the device stops retransmitting.
            out.reply = Some(self.ack());
            return out;
        }
        if !can_deliver {
            return out;
        }

        let data = &payload[skip..];
        out.deliver.extend_from_slice(data);
        self.advance(data.len());
        if fin {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.device_fin = true;
            self.reassembly.clear();
            self.reassembly_bytes = 0;
            out.shutdown_upstream = true;
            if self.state == TcpState::Established {
                self.state = TcpState::FinWait;
            }
        } else {
            self.drain_reassembly(&mut out.deliver);
        }
        out.reply = Some(self.ack());
        self.check_finished(&mut out);
        out
    }

    fn on_ack(&mut self, ack: u32, window: u16, out: &mut Outcome) {
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        let acked = ack.wrapping_sub(self.snd_una);
        if acked > in_flight {
            // Acknowledges something we never sent.
            return;
        }
        if acked > 0 {
            self.snd_una = ack;
            out.window_update = true;
            if self.state == TcpState::SynReceived && ack == self.our_isn.wrapping_add(1) {
                self.state = TcpState::Established;
            }
            if self.fin_seq.map(|s| s.wrapping_add(1)) == Some(ack) {
                self.fin_acked = true;
            }
        }
        if window as u32 != self.snd_wnd {
            self.snd_wnd = window as u32;
            out.window_update = true;
        }
    }

    fn advance(&mut self, n: usize) {
        self.rcv_nxt = self.rcv_nxt.wrapping_add(n as u32);
        self.delivered += n as u64;
    }

    fn buffer_out_of_order(&mut self, offset: usize, payload: &[u8]) {
        if payload.is_empty()
            || offset + payload.len() > self.max_reassembly
            || self.reassembly_bytes + payload.len() > self.max_reassembly
        {
            return;
        }
        let start = self.delivered + offset as u64;
        if let Some(existing) = self.reassembly.get(&start) {
            if existing.len() >= payload.len() {
                return;
            }
        }
        if let Some(old) = self.reassembly.insert(start, payload.to_vec()) {
            self.reassembly_bytes -= old.len();
        }
        self.reassembly_bytes += payload.len();
    }

    fn drain_reassembly(&mut self, out: &mut Vec<u8>) {
        while let Some(entry) = self.reassembly.first_entry() {
            let start = *entry.key();
            if start > self.delivered {
                break;
            }
            let chunk = entry.remove();
            self.reassembly_bytes -= chunk.len();
            let skip = (self.delivered - start) as usize;
            if skip < chunk.len() {
                out.extend_from_slice(&chunk[skip..]);
                self.advance(chunk.len() - skip);
            }
        }
    }

    fn check_finished(&mut self, out: &mut Outcome) {
        if self.device_fin && self.fin_acked && self.state != TcpState::Closed {
            self.state = TcpState::Closed;
            out.finished = true;
        }
    }

    /// Bytes the device is currently willing to accept from us.
    ///
    /// Zero until the handshake completes, so no data overtakes the SYN-ACK.
    pub(crate) fn send_window(&self) -> usize {
        match self.state {
            TcpState::Established | TcpState::FinWait => {
                let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
                self.snd_wnd.saturating_sub(in_flight) as usize
            }
            _ => 0,
        }
    }

    /// Reserves sequence space for `len` bytes of upstream data.
    pub(crate) fn next_data(&mut self, len: usize) -> Reply {
        let reply = Reply {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::ACK | TcpFlags::PSH,
        };
        self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
        reply
    }

    /// The remote closed its side; returns the FIN to send, once.
    pub(crate) fn on_remote_eof(&mut self) -> Option<Reply> {
        if self.fin_seq.is_some()
            || matches!(self.state, TcpState::Connecting | TcpState::Closed)
        {
            return None;
        }
        let reply = Reply {
            seq: self.snd_nxt,
            ack: self.rcv_nxt,
            flags: TcpFlags::FIN | TcpFlags::ACK,
        };
        self.fin_seq = Some(self.snd_nxt);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.state = TcpState::Closing;
        Some(reply)
    }

    /// Moves to `Closed`, returning the RST to send unless the connection already ended.
    pub(crate) fn take_reset(&mut self) -> Option<Reply> {
        let seq = match self.state {
            TcpState::Closed => return None,
            TcpState::Connecting => 0,
            _ => self.snd_nxt,
        };
        self.state = TcpState::Closed;
        Some(Reply {
            seq,
            ack: self.rcv_nxt,
            flags: TcpFlags::RST | TcpFlags::ACK,
        })
    }
}
