//! UDP transport for DNS queries.
//!
//! One socket carries both directions: client queries arrive on it,
//! sub-queries leave from it, and upstream replies come back to it. Each
//! datagram is handled in its own task so a slow exchange never blocks
//! intake of unrelated datagrams.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::engine::{Engine, Outbound};

use super::{MAX_UDP_PAYLOAD, sweep_interval};

/// UDP transport for the DNS proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the shared UDP socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Start the UDP transport.
    ///
    /// Spawns the receive loop and the expiry sweep on the current
    /// `LocalSet`.
    pub fn start(self, engine: Arc<Engine>) {
        let interval = sweep_interval(engine.pending().timeout());
        tokio::task::spawn_local(run_expiry_sweep(
            self.socket.clone(),
            engine.clone(),
            interval,
        ));
        tokio::task::spawn_local(run_recv_loop(self.socket, engine));
    }
}

/// Receive loop - spawns a handler task for each datagram.
async fn run_recv_loop(socket: Arc<UdpSocket>, engine: Arc<Engine>) {
    let mut buf = [0u8; MAX_UDP_PAYLOAD];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "UDP recv error");
                continue;
            }
        };

        let datagram = buf[..len].to_vec();
        tokio::task::spawn_local(handle_datagram(
            socket.clone(),
            engine.clone(),
            datagram,
            src,
        ));
    }
}

/// Decode one datagram, run it through the engine and send the results.
async fn handle_datagram(
    socket: Arc<UdpSocket>,
    engine: Arc<Engine>,
    datagram: Vec<u8>,
    src: SocketAddr,
) {
    match engine.handle(&datagram, src, Instant::now()) {
        Ok(outbound) => send_all(&socket, engine.upstream(), outbound).await,
        Err(e) => {
            warn!(%src, len = datagram.len(), error = %e, "dropping malformed datagram");
        }
    }
}

/// Periodically answer and drop queries the upstream never answered.
async fn run_expiry_sweep(
    socket: Arc<UdpSocket>,
    engine: Arc<Engine>,
    period: std::time::Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let outbound = engine.expire(Instant::now());
        if !outbound.is_empty() {
            debug!(expired = outbound.len(), "expired pending queries");
            send_all(&socket, engine.upstream(), outbound).await;
        }
    }
}

async fn send_all(socket: &UdpSocket, upstream: SocketAddr, outbound: Vec<Outbound>) {
    for datagram in outbound {
        let (bytes, dest) = match datagram {
            Outbound::Client { addr, bytes } => (bytes, addr),
            Outbound::Upstream { bytes } => (bytes, upstream),
        };

        if let Err(e) = socket.send_to(&bytes, dest).await {
            warn!(%dest, error = %e, "UDP send error");
        }
    }
}
