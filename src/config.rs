//! Proxy configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default path of the hosts override source.
pub const DEFAULT_HOSTS_PATH: &str = "hosts.ini";

/// Default listen address for both UDP and TCP.
pub const DEFAULT_BIND: &str = "0.0.0.0:53";

/// Default upstream resolver.
pub const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    /// Upstream DNS server, used for both UDP and TCP
    pub upstream: SocketAddr,
    /// Hosts override source
    pub hosts_path: PathBuf,
    /// How long a query may wait on upstream before it is answered SERVFAIL
    pub timeout: Duration,
    /// How often the hosts file is checked for changes
    pub reload_interval: Duration,
    /// How often statistics are logged
    pub stats_interval: Duration,
}
