//! hostsdns - a forwarding DNS proxy with a hot-reloadable hosts override
//! table.
//!
//! A records for names in the hosts file are answered locally; every other
//! question is forwarded upstream as its own sub-query and the replies are
//! merged back into one answer per client query.

pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod hosts;
pub mod pending;
pub mod pool;
pub mod proxy;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
