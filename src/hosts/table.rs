//! Immutable hosts override table.
//!
//! Parsed from an INI-style source with a `[hosts]` section:
//!
//! ```text
//! [hosts]
//! router.lan = 192.168.1.1
//! example.com = 10.0.0.7
//! ```

use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::dns::Name;

/// Section holding the override entries.
const HOSTS_SECTION: &str = "hosts";

/// Longest name in wire form.
const MAX_WIRE_LEN: usize = 255;

/// A snapshot of name to IPv4 overrides.
///
/// Keys are lower-cased wire-form names, so a lookup compares labels
/// exactly and a `.` inside a label never matches a label boundary.
#[derive(Debug, Default, Clone)]
pub struct HostsTable {
    entries: FxHashMap<Box<[u8]>, Ipv4Addr>,
}

impl HostsTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from the override source text.
    ///
    /// Entries whose value is not a dotted-quad IPv4 address are skipped
    /// individually; the rest of the source still loads.
    pub fn parse(source: &str) -> Self {
        let mut entries = FxHashMap::default();
        let mut in_hosts = false;

        for (lineno, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_hosts = section.trim() == HOSTS_SECTION;
                continue;
            }

            if !in_hosts {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(line = lineno + 1, "skipping hosts line without '='");
                continue;
            };
            let key = key.trim();
            let value = unquote(value.trim());

            if key.is_empty() {
                warn!(line = lineno + 1, "skipping hosts entry with empty name");
                continue;
            }

            let Ok(name) = Name::from_ascii(key) else {
                warn!(host = key, "skipping hosts entry with invalid name");
                continue;
            };
            match parse_ipv4(value) {
                Some(addr) => {
                    let mut wire = name.as_wire().to_vec();
                    wire.make_ascii_lowercase();
                    entries.insert(wire.into_boxed_slice(), addr);
                }
                None => {
                    warn!(host = key, value, "skipping malformed hosts entry");
                }
            }
        }

        Self { entries }
    }

    /// Look up a wire name, ignoring ASCII case.
    pub fn lookup(&self, name: &Name) -> Option<Ipv4Addr> {
        let wire = name.as_wire();
        let mut key = [0u8; MAX_WIRE_LEN];
        let key = key.get_mut(..wire.len())?;
        key.copy_from_slice(wire);
        // Length octets never fall in the ASCII letter range.
        key.make_ascii_lowercase();
        self.entries.get(&*key).copied()
    }

    /// Look up a dotted name; case and trailing dot do not matter.
    pub fn get(&self, name: &str) -> Option<Ipv4Addr> {
        self.lookup(&Name::from_ascii(name.trim()).ok()?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse exactly four dot-separated octets, each an integer in [0, 255].
pub fn parse_ipv4(value: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut parts = value.split('.');

    for octet in &mut octets {
        *octet = parts.next()?.trim().parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }

    Some(Ipv4Addr::from(octets))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "\
; local overrides
[hosts]
router.lan = 192.168.1.1
Example.COM = 10.0.0.7
quoted.test = \"127.0.0.2\"
short.test = 1.2.3
big.test = 1.2.3.400
letters.test = a.b.c.d
long.test = 1.2.3.4.5

[other]
ignored.test = 8.8.8.8
";

    #[test]
    fn parse_loads_valid_entries() {
        let table = HostsTable::parse(SOURCE);

        assert_eq!(table.len(), 3);
        assert_eq!(table.get("router.lan."), Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(table.get("quoted.test"), Some(Ipv4Addr::new(127, 0, 0, 2)));
    }

    #[test]
    fn parse_skips_malformed_entries() {
        let table = HostsTable::parse(SOURCE);

        assert_eq!(table.get("short.test."), None);
        assert_eq!(table.get("big.test."), None);
        assert_eq!(table.get("letters.test."), None);
        assert_eq!(table.get("long.test."), None);
    }

    #[test]
    fn parse_ignores_other_sections() {
        let table = HostsTable::parse(SOURCE);

        assert_eq!(table.get("ignored.test."), None);
    }

    #[test]
    fn get_is_case_insensitive() {
        let table = HostsTable::parse(SOURCE);

        assert_eq!(table.get("example.com."), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(table.get("EXAMPLE.com"), Some(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn parse_empty_source() {
        assert!(HostsTable::parse("").is_empty());
        assert!(HostsTable::parse("[hosts]\n").is_empty());
    }

    #[test]
    fn parse_ipv4_bounds() {
        assert_eq!(parse_ipv4("0.0.0.0"), Some(Ipv4Addr::UNSPECIFIED));
        assert_eq!(parse_ipv4("255.255.255.255"), Some(Ipv4Addr::BROADCAST));
        assert_eq!(parse_ipv4("256.0.0.1"), None);
        assert_eq!(parse_ipv4("-1.0.0.1"), None);
        assert_eq!(parse_ipv4("1..2.3"), None);
        assert_eq!(parse_ipv4(""), None);
    }

    #[test]
    fn lookup_matches_labels_not_text() {
        let table = HostsTable::parse(SOURCE);

        let two_labels = Name::from_ascii("ROUTER.lan").unwrap();
        assert_eq!(table.lookup(&two_labels), Some(Ipv4Addr::new(192, 168, 1, 1)));

        // One label whose bytes are "router.lan".
        let mut query = vec![0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 10];
        query.extend_from_slice(b"router.lan");
        query.extend_from_slice(&[0, 0, 1, 0, 1]);
        let message = crate::dns::Message::decode(&query).unwrap();
        assert_eq!(table.lookup(&message.questions[0].name), None);
    }

    #[test]
    fn parse_skips_invalid_names() {
        let table = HostsTable::parse("[hosts]\nbad..name = 1.1.1.1\nok.test = 2.2.2.2\n");

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("ok.test"), Some(Ipv4Addr::new(2, 2, 2, 2)));
    }
}
