//! TCP transport for DNS queries.
//!
//! Relays DNS messages between a client connection and the upstream
//! without parsing them. Messages are framed with the standard 2-byte
//! big-endian length prefix; each client connection gets one upstream
//! connection, used for every query the client sends on it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, warn};

/// TCP transport for the DNS proxy.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the TCP transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    /// `timeout` bounds every read and the upstream connect.
    pub fn start(self, upstream_addr: SocketAddr, timeout: Duration) {
        tokio::task::spawn_local(run_accept_loop(self.listener, upstream_addr, timeout));
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(listener: TcpListener, upstream_addr: SocketAddr, timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::task::spawn_local(handle_connection(client, peer, upstream_addr, timeout));
            }
            Err(e) => {
                warn!(error = %e, "TCP accept error");
            }
        }
    }
}

async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    upstream_addr: SocketAddr,
    timeout: Duration,
) {
    match relay(client, upstream_addr, timeout).await {
        Ok(relayed) => debug!(%peer, relayed, "TCP connection closed"),
        Err(e) => warn!(%peer, error = %e, "TCP relay failed"),
    }
}

/// Relay framed messages until the client closes the connection or goes
/// idle for longer than `timeout`.
///
/// Returns the number of exchanges relayed.
async fn relay(
    mut client: TcpStream,
    upstream_addr: SocketAddr,
    timeout: Duration,
) -> io::Result<usize> {
    let Some(mut query) = read_framed(&mut client, timeout).await? else {
        return Ok(0);
    };
    let mut upstream = connect(upstream_addr, timeout).await?;
    let mut relayed = 0;

    loop {
        write_framed(&mut upstream, &query).await?;
        let response = read_framed(&mut upstream, timeout).await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed before replying")
        })?;
        write_framed(&mut client, &response).await?;
        relayed += 1;

        query = match read_framed(&mut client, timeout).await {
            Ok(Some(next)) => next,
            Ok(None) => return Ok(relayed),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(relayed),
            Err(e) => return Err(e),
        };
    }
}

async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| timed_out("upstream connect"))?
}

/// Read one length-prefixed DNS message.
///
/// Returns `None` if the stream ends cleanly before a new message starts.
pub async fn read_framed<R>(reader: &mut R, timeout: Duration) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    match time::timeout(timeout, reader.read_exact(&mut prefix)).await {
        Err(_) => return Err(timed_out("length prefix")),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(_)) => {}
    }

    let len = u16::from_be_bytes(prefix) as usize;
    let mut message = vec![0u8; len];
    time::timeout(timeout, reader.read_exact(&mut message))
        .await
        .map_err(|_| timed_out("message body"))??;

    Ok(Some(message))
}

/// Write one DNS message with its length prefix.
pub async fn write_framed<W>(writer: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "DNS message exceeds 65535 bytes")
    })?;

    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    writer.write_all(&framed).await
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("timed out reading {what}"))
}
