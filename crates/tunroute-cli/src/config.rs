use std::time::Duration;

use clap::Parser;
use tunroute_router::RouterConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunroute", version, about = "Relay a tun device's TCP and UDP flows over host sockets")]
pub struct Args {
    /// Open file descriptor of the tun device, inherited from the process that configured it.
    ///
    /// Environment variable: `TUNROUTE_TUN_FD`.
    #[arg(long, env = "TUNROUTE_TUN_FD")]
    pub tun_fd: i32,

    /// MTU of the tun interface; also the size of every pooled packet buffer.
    #[arg(long, env = "TUNROUTE_MTU", default_value_t = 1500)]
    pub mtu: usize,

    /// Seconds a UDP flow may stay silent before its socket is closed.
    #[arg(long, env = "TUNROUTE_UDP_IDLE_SECS", default_value_t = 60)]
    pub udp_idle_secs: u64,

    /// Seconds an established TCP connection may stay silent before it is reset.
    #[arg(long, env = "TUNROUTE_TCP_IDLE_SECS", default_value_t = 600)]
    pub tcp_idle_secs: u64,

    /// Upstream connect timeout in seconds. 0 waits for the OS to give up.
    #[arg(long, env = "TUNROUTE_TCP_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub tcp_connect_timeout_secs: u64,

    /// Capacity of each device → flow manager queue.
    #[arg(long, env = "TUNROUTE_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Upper bound on packet buffers in flight at once.
    #[arg(long, env = "TUNROUTE_MAX_BUFFERS", default_value_t = 4096)]
    pub max_buffers: usize,

    /// Seconds between metrics log lines. 0 disables them.
    #[arg(long, env = "TUNROUTE_STATS_INTERVAL_SECS", default_value_t = 60)]
    pub stats_interval_secs: u64,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    #[arg(long, env = "TUNROUTE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            mtu: self.mtu,
            pool_max_outstanding: self.max_buffers,
            device_queue_capacity: self.queue_capacity,
            udp_idle_timeout: Duration::from_secs(self.udp_idle_secs),
            tcp_idle_timeout: Duration::from_secs(self.tcp_idle_secs),
            tcp_connect_timeout: (self.tcp_connect_timeout_secs > 0)
                .then(|| Duration::from_secs(self.tcp_connect_timeout_secs)),
            ..RouterConfig::default()
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_router_defaults() {
        let args = Args::try_parse_from(["tunroute", "--tun-fd", "3"]).unwrap();
        let cfg = args.router_config();
        let defaults = RouterConfig::default();
        assert_eq!(args.tun_fd, 3);
        assert_eq!(cfg.mtu, defaults.mtu);
        assert_eq!(cfg.udp_idle_timeout, defaults.udp_idle_timeout);
        assert_eq!(cfg.tcp_idle_timeout, defaults.tcp_idle_timeout);
        assert_eq!(cfg.tcp_connect_timeout, defaults.tcp_connect_timeout);
        assert_eq!(cfg.device_queue_capacity, defaults.device_queue_capacity);
        assert_eq!(args.stats_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn zero_disables_optional_timers() {
        let args = Args::try_parse_from([
            "tunroute",
            "--tun-fd",
            "5",
            "--tcp-connect-timeout-secs",
            "0",
            "--stats-interval-secs",
            "0",
            "--mtu",
            "1280",
        ])
        .unwrap();
        let cfg = args.router_config();
        assert_eq!(cfg.tcp_connect_timeout, None);
        assert_eq!(cfg.mtu, 1280);
        assert!(cfg.validate().is_ok());
        assert_eq!(args.stats_interval(), None);
    }

    #[test]
    fn tun_fd_is_required() {
        assert!(Args::try_parse_from(["tunroute"]).is_err());
    }
}
