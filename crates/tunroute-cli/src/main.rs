#![deny(unsafe_code)]

mod config;
mod tun;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tunroute_router::{Metrics, PacketRouter};

use crate::config::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let tunnel = tun::adopt_fd(args.tun_fd)?;
    let router = PacketRouter::new(args.router_config()).context("invalid router config")?;
    router.start(tunnel).context("start packet router")?;
    tracing::info!(fd = args.tun_fd, mtu = args.mtu, "relaying tun device");

    let stats = log_stats(router.metrics().clone(), args.stats_interval());

    // Best-effort graceful shutdown on Ctrl+C / SIGTERM.
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let outcome = tokio::select! {
        _ = ctrl_c => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
        _ = sigterm => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
        res = router.wait() => res,
    };

    stats.abort();
    router.stop().await;
    tracing::debug!("final metrics:\n{}", router.metrics().render_prometheus());
    outcome.context("tunnel failed")
}

fn log_stats(metrics: Metrics, interval: Option<Duration>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(interval) = interval else {
            return;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let s = metrics.snapshot();
            tracing::info!(
                tcp_sessions = s.tcp_sessions_active,
                udp_sessions = s.udp_sessions_active,
                packets_in = s.packets_from_device,
                packets_out = s.packets_to_device,
                dropped = s.dropped_total(),
                "router stats"
            );
        }
    })
}
