//! Transport layer implementations for the DNS proxy.
//!
//! The UDP transport owns the single shared socket and feeds every datagram
//! to the correlation engine. The TCP transport relays framed messages to
//! the upstream without looking inside them.

pub mod tcp;
pub mod udp;

use std::time::Duration;

/// Largest UDP datagram read or sent, the traditional DNS limit. Longer
/// datagrams are truncated by the read and then fail to decode; longer
/// replies are cut down and flagged TC.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Shortest period between two expiry sweeps.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// How often pending queries are checked for expiry.
pub fn sweep_interval(timeout: Duration) -> Duration {
    (timeout / 2).max(MIN_SWEEP_INTERVAL)
}
