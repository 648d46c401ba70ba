use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use hostsdns::config::{DEFAULT_BIND, DEFAULT_HOSTS_PATH, DEFAULT_UPSTREAM, ProxyConfig};
use hostsdns::proxy;

#[derive(Parser)]
#[command(name = "hostsdns")]
#[command(about = "Forwarding DNS proxy with hosts overrides", long_about = None)]
struct Args {
    /// Hosts override file ([hosts] section of name = IPv4 entries)
    #[arg(short, long, default_value = DEFAULT_HOSTS_PATH)]
    conf: PathBuf,

    /// Address to listen on for UDP and TCP
    #[arg(short, long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Upstream DNS server (ip:port)
    #[arg(short, long, default_value = DEFAULT_UPSTREAM)]
    upstream: SocketAddr,

    /// Seconds to wait for upstream before answering SERVFAIL
    #[arg(long, default_value = "5")]
    timeout_secs: u64,

    /// Milliseconds between hosts file change checks
    #[arg(long, default_value = "1000")]
    reload_interval_ms: u64,

    /// Seconds between stats log lines
    #[arg(long, default_value = "60")]
    stats_interval_secs: u64,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            bind_addr: self.bind,
            upstream: self.upstream,
            hosts_path: self.conf,
            timeout: Duration::from_secs(self.timeout_secs.max(1)),
            reload_interval: Duration::from_millis(self.reload_interval_ms.max(10)),
            stats_interval: Duration::from_secs(self.stats_interval_secs.max(1)),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    let local = tokio::task::LocalSet::new();
    match local.block_on(&rt, proxy::run(args.into_config())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}
