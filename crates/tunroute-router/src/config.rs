use std::time::Duration;

use crate::RouterError;

/// Smallest MTU we accept; an IPv4 host must be able to handle 576-byte datagrams.
pub const MIN_MTU: usize = 576;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Largest IP packet read from or written to the tunnel. Also the pooled buffer size.
    pub mtu: usize,

    /// Free buffers retained by the pool; buffers released beyond this are deallocated.
    pub pool_max_free: usize,
    /// Hard ceiling on buffers in flight at once. Past it, reads from the tunnel are dropped.
    pub pool_max_outstanding: usize,

    /// Capacity of each reader → flow manager queue (one for TCP, one for UDP).
    pub device_queue_capacity: usize,
    /// Capacity of the shared synthesized-packet queue drained by the device writer.
    pub outbound_queue_capacity: usize,
    /// Packets for flows without a session are only queued while the queue is filled below this
    /// percentage; existing sessions may use the whole queue.
    pub new_flow_admission_percent: u8,

    /// Sleep applied by the reader when the tunnel has nothing to read.
    pub reader_idle_backoff: Duration,

    pub sweep_interval: Duration,
    pub udp_idle_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    /// Sessions still waiting for the upstream connect or the device's handshake ACK are evicted
    /// after this long.
    pub tcp_handshake_timeout: Duration,
    /// `None` waits for the OS connect timeout.
    pub tcp_connect_timeout: Option<Duration>,

    /// Receive window advertised to the device.
    pub tcp_window: u16,
    /// Out-of-order device bytes buffered per session while waiting for a gap to fill.
    pub tcp_max_reassembly_bytes: usize,
    /// Per-session queue (in segments) between the TCP manager and the upstream socket writer.
    pub tcp_uplink_queue: usize,
    /// Upper bound of a single upstream socket read before it is cut into MSS-sized segments.
    pub tcp_read_chunk: usize,

    /// TTL / hop limit on synthesized packets.
    pub ttl: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            pool_max_free: 256,
            pool_max_outstanding: 4096,
            device_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            new_flow_admission_percent: 75,
            reader_idle_backoff: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(5),
            udp_idle_timeout: Duration::from_secs(60),
            tcp_idle_timeout: Duration::from_secs(600),
            tcp_handshake_timeout: Duration::from_secs(20),
            tcp_connect_timeout: Some(Duration::from_secs(10)),
            tcp_window: u16::MAX,
            tcp_max_reassembly_bytes: 64 * 1024,
            tcp_uplink_queue: 64,
            tcp_read_chunk: 16 * 1024,
            ttl: tunroute_packet::DEFAULT_TTL,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        if !(MIN_MTU..=u16::MAX as usize).contains(&self.mtu) {
            return Err(RouterError::InvalidConfig("mtu must be between 576 and 65535"));
        }
        if self.pool_max_outstanding == 0 {
            return Err(RouterError::InvalidConfig("pool_max_outstanding must be non-zero"));
        }
        if self.device_queue_capacity == 0 || self.outbound_queue_capacity == 0 {
            return Err(RouterError::InvalidConfig("queue capacities must be non-zero"));
        }
        if !(1..=100).contains(&self.new_flow_admission_percent) {
            return Err(RouterError::InvalidConfig(
                "new_flow_admission_percent must be between 1 and 100",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(RouterError::InvalidConfig("sweep_interval must be non-zero"));
        }
        if self.tcp_uplink_queue == 0 || self.tcp_read_chunk == 0 {
            return Err(RouterError::InvalidConfig(
                "tcp_uplink_queue and tcp_read_chunk must be non-zero",
            ));
        }
        if self.ttl == 0 {
            return Err(RouterError::InvalidConfig("ttl must be non-zero"));
        }
        Ok(())
    }

    /// Free slots a device queue must still have for a packet of a new flow to be admitted.
    pub(crate) fn new_flow_reserve(&self) -> usize {
        let admitted = self.device_queue_capacity * self.new_flow_admission_percent as usize / 100;
        self.device_queue_capacity - admitted
    }
}
