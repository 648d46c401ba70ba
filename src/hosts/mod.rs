//! Hosts override table.
//!
//! Answers A queries for configured names locally instead of asking the
//! upstream. The active table is an immutable [`HostsTable`] snapshot held in
//! an `ArcSwap`: lookups are lock-free and a reload swaps in a fully built
//! table, so readers see either the old table or the new one.

mod table;
mod watcher;

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::error::{Error, Result};

pub use table::{HostsTable, parse_ipv4};
pub use watcher::HostsWatcher;

/// Hot-reloadable override table shared by the engine and the watcher.
pub struct Overrides {
    table: ArcSwap<HostsTable>,
}

impl Overrides {
    pub fn new(table: HostsTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    /// Load the initial table from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|source| Error::Hosts {
            path: path.to_path_buf(),
            source,
        })?;
        let table = HostsTable::parse(&source);
        info!(path = %path.display(), entries = table.len(), "loaded hosts overrides");

        Ok(Self::new(table))
    }

    /// Look up the override address for `name`.
    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.table.load().get(name)
    }

    /// Current table snapshot.
    pub fn snapshot(&self) -> Arc<HostsTable> {
        self.table.load_full()
    }

    /// Parse `source` off to the side and install it atomically.
    ///
    /// Returns the number of entries in the new table.
    pub fn reload(&self, source: &str) -> usize {
        let table = HostsTable::parse(source);
        let len = table.len();
        self.table.store(Arc::new(table));
        len
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }
}

impl Default for Overrides {
    fn default() -> Self {
        Self::new(HostsTable::empty())
    }
}
