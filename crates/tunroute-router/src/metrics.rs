use std::fmt::Write as _;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Why an inbound or synthesized packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Failed to parse as an IPv4/IPv6 packet.
    Malformed,
    /// ICMP or another protocol the router does not relay.
    Unsupported,
    /// A device → manager queue was full, or was above the new-flow watermark.
    QueueFull,
    /// No pooled buffer was available for the tunnel read or a synthesized packet.
    PoolExhausted,
    /// The outbound queue towards the device writer was full.
    OutboundFull,
    /// A remote UDP datagram would not fit in a single MTU-sized packet.
    Oversized,
}

/// Shared router counters. Cheap to clone; every clone updates the same values.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Tunnel
    packets_from_device: AtomicU64,
    bytes_from_device: AtomicU64,
    packets_to_device: AtomicU64,
    bytes_to_device: AtomicU64,

    // Drops
    dropped_malformed: AtomicU64,
    dropped_unsupported: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_pool_exhausted: AtomicU64,
    dropped_outbound_full: AtomicU64,
    dropped_oversized: AtomicU64,

    // TCP
    tcp_sessions_active: AtomicU64,
    tcp_sessions_total: AtomicU64,
    tcp_connect_fail_total: AtomicU64,
    tcp_resets_sent_total: AtomicU64,
    tcp_bytes_uplink: AtomicU64,
    tcp_bytes_downlink: AtomicU64,

    // UDP
    udp_sessions_active: AtomicU64,
    udp_sessions_total: AtomicU64,
    udp_open_fail_total: AtomicU64,
    udp_send_fail_total: AtomicU64,

    sessions_evicted_total: AtomicU64,
}

/// Point-in-time copy of every counter in [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_from_device: u64,
    pub bytes_from_device: u64,
    pub packets_to_device: u64,
    pub bytes_to_device: u64,
    pub dropped_malformed: u64,
    pub dropped_unsupported: u64,
    pub dropped_queue_full: u64,
    pub dropped_pool_exhausted: u64,
    pub dropped_outbound_full: u64,
    pub dropped_oversized: u64,
    pub tcp_sessions_active: u64,
    pub tcp_sessions_total: u64,
    pub tcp_connect_fail_total: u64,
    pub tcp_resets_sent_total: u64,
    pub tcp_bytes_uplink: u64,
    pub tcp_bytes_downlink: u64,
    pub udp_sessions_active: u64,
    pub udp_sessions_total: u64,
    pub udp_open_fail_total: u64,
    pub udp_send_fail_total: u64,
    pub sessions_evicted_total: u64,
}

impl MetricsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_unsupported
            + self.dropped_queue_full
            + self.dropped_pool_exhausted
            + self.dropped_outbound_full
            + self.dropped_oversized
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_from_device(&self, bytes: usize) {
        bump(&self.inner.packets_from_device, 1);
        bump(&self.inner.bytes_from_device, bytes as u64);
    }

    pub fn packet_to_device(&self, bytes: usize) {
        bump(&self.inner.packets_to_device, 1);
        bump(&self.inner.bytes_to_device, bytes as u64);
    }

    pub fn dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.inner.dropped_malformed,
            DropReason::Unsupported => &self.inner.dropped_unsupported,
            DropReason::QueueFull => &self.inner.dropped_queue_full,
            DropReason::PoolExhausted => &self.inner.dropped_pool_exhausted,
            DropReason::OutboundFull => &self.inner.dropped_outbound_full,
            DropReason::Oversized => &self.inner.dropped_oversized,
        };
        bump(counter, 1);
    }

    pub fn tcp_session_opened(&self) {
        bump(&self.inner.tcp_sessions_total, 1);
        bump(&self.inner.tcp_sessions_active, 1);
    }

    pub fn tcp_session_closed(&self) {
        self.inner.tcp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tcp_connect_failed(&self) {
        bump(&self.inner.tcp_connect_fail_total, 1);
    }

    pub fn tcp_reset_sent(&self) {
        bump(&self.inner.tcp_resets_sent_total, 1);
    }

    pub fn tcp_uplink(&self, bytes: usize) {
        bump(&self.inner.tcp_bytes_uplink, bytes as u64);
    }

    pub fn tcp_downlink(&self, bytes: usize) {
        bump(&self.inner.tcp_bytes_downlink, bytes as u64);
    }

    pub fn udp_session_opened(&self) {
        bump(&self.inner.udp_sessions_total, 1);
        bump(&self.inner.udp_sessions_active, 1);
    }

    pub fn udp_session_closed(&self) {
        self.inner.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn udp_open_failed(&self) {
        bump(&self.inner.udp_open_fail_total, 1);
    }

    pub fn udp_send_failed(&self) {
        bump(&self.inner.udp_send_fail_total, 1);
    }

    pub fn sessions_evicted(&self, count: usize) {
        bump(&self.inner.sessions_evicted_total, count as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let m = &self.inner;
        MetricsSnapshot {
            packets_from_device: read(&m.packets_from_device),
            bytes_from_device: read(&m.bytes_from_device),
            packets_to_device: read(&m.packets_to_device),
            bytes_to_device: read(&m.bytes_to_device),
            dropped_malformed: read(&m.dropped_malformed),
            dropped_unsupported: read(&m.dropped_unsupported),
            dropped_queue_full: read(&m.dropped_queue_full),
            dropped_pool_exhausted: read(&m.dropped_pool_exhausted),
            dropped_outbound_full: read(&m.dropped_outbound_full),
            dropped_oversized: read(&m.dropped_oversized),
            tcp_sessions_active: read(&m.tcp_sessions_active),
            tcp_sessions_total: read(&m.tcp_sessions_total),
            tcp_connect_fail_total: read(&m.tcp_connect_fail_total),
            tcp_resets_sent_total: read(&m.tcp_resets_sent_total),
            tcp_bytes_uplink: read(&m.tcp_bytes_uplink),
            tcp_bytes_downlink: read(&m.tcp_bytes_downlink),
            udp_sessions_active: read(&m.udp_sessions_active),
            udp_sessions_total: read(&m.udp_sessions_total),
            udp_open_fail_total: read(&m.udp_open_fail_total),
            udp_send_fail_total: read(&m.udp_send_fail_total),
            sessions_evicted_total: read(&m.sessions_evicted_total),
        }
    }

    /// Prometheus text exposition of the current counters.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        push_counter(&mut out, "tunroute_packets_from_device_total", s.packets_from_device);
        push_counter(&mut out, "tunroute_bytes_from_device_total", s.bytes_from_device);
        push_counter(&mut out, "tunroute_packets_to_device_total", s.packets_to_device);
        push_counter(&mut out, "tunroute_bytes_to_device_total", s.bytes_to_device);

        for (reason, val) in [
            ("malformed", s.dropped_malformed),
            ("unsupported", s.dropped_unsupported),
            ("queue_full", s.dropped_queue_full),
            ("pool_exhausted", s.dropped_pool_exhausted),
            ("outbound_full", s.dropped_outbound_full),
            ("oversized", s.dropped_oversized),
        ] {
            push_counter(
                &mut out,
                &format!("tunroute_packets_dropped_{reason}_total"),
                val,
            );
        }

        push_gauge(&mut out, "tunroute_tcp_sessions_active", s.tcp_sessions_active);
        push_counter(&mut out, "tunroute_tcp_sessions_total", s.tcp_sessions_total);
        push_counter(&mut out, "tunroute_tcp_connect_fail_total", s.tcp_connect_fail_total);
        push_counter(&mut out, "tunroute_tcp_resets_sent_total", s.tcp_resets_sent_total);
        push_counter(&mut out, "tunroute_tcp_bytes_uplink_total", s.tcp_bytes_uplink);
        push_counter(&mut out, "tunroute_tcp_bytes_downlink_total", s.tcp_bytes_downlink);

        push_gauge(&mut out, "tunroute_udp_sessions_active", s.udp_sessions_active);
        push_counter(&mut out, "tunroute_udp_sessions_total", s.udp_sessions_total);
        push_counter(&mut out, "tunroute_udp_open_fail_total", s.udp_open_fail_total);
        push_counter(&mut out, "tunroute_udp_send_fail_total", s.udp_send_fail_total);

        push_counter(&mut out, "tunroute_sessions_evicted_total", s.sessions_evicted_total);

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_sample(out, "gauge", name, val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_sample(out, "counter", name, val);
}

fn push_sample(out: &mut String, kind: &str, name: &str, val: u64) {
    // Writing into a String cannot fail.
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {val}");
}
