//! DNS proxy orchestration.
//!
//! Loads the hosts overrides, binds transports and runs the proxy server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tracing::info;

use crate::config::ProxyConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::hosts::{HostsWatcher, Overrides};
use crate::stats::Stats;
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// A started proxy.
pub struct Proxy {
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    pub engine: Arc<Engine>,
    pub overrides: Arc<Overrides>,
    pub stats: Arc<Stats>,
}

/// Load the hosts file, bind both transports and start every task on the
/// current `LocalSet`.
///
/// Failing to read the hosts file or to bind a socket is an error; once
/// started, faults are logged and the proxy keeps serving.
pub async fn start(config: &ProxyConfig) -> Result<Proxy> {
    let overrides = Arc::new(Overrides::load(&config.hosts_path)?);
    let stats = Arc::new(Stats::new());
    let engine = Arc::new(Engine::new(
        overrides.clone(),
        config.upstream,
        config.timeout,
        stats.clone(),
    ));

    let udp = UdpTransport::bind(config.bind_addr).await?;
    let tcp = TcpTransport::bind(config.bind_addr).await?;
    let udp_addr = udp.local_addr()?;
    let tcp_addr = tcp.local_addr()?;

    info!(
        %udp_addr,
        %tcp_addr,
        upstream = %config.upstream,
        overrides = overrides.len(),
        "DNS proxy listening"
    );

    HostsWatcher::new(&config.hosts_path, overrides.clone(), config.reload_interval).start();
    udp.start(engine.clone());
    tcp.start(config.upstream, config.timeout);

    Ok(Proxy {
        udp_addr,
        tcp_addr,
        engine,
        overrides,
        stats,
    })
}

/// Run the DNS proxy with the given configuration.
///
/// Runs until interrupted.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let proxy = start(&config).await?;

    let reporter = report_stats(proxy, config.stats_interval);
    future::select(Box::pin(reporter), Box::pin(shutdown_signal())).await;
    info!("shutting down");

    Ok(())
}

/// Log stats periodically.
async fn report_stats(proxy: Proxy, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let stats = proxy.stats.snapshot_and_reset();
        info!(
            requests = stats.requests,
            answered_locally = stats.answered_locally,
            forwarded = stats.forwarded,
            completed = stats.completed,
            expired = stats.expired,
            misses = stats.misses,
            decode_errors = stats.decode_errors,
            pending = proxy.engine.pending().len(),
            overrides = proxy.overrides.len(),
            avg_upstream_ms = format_args!("{:.2}", stats.avg_upstream_ms),
            "stats"
        );
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        future::pending::<()>().await;
    }
}
