//! Geolocation Module
//!
//! This module maps source IPs to country codes using an immutable snapshot
//! of a local prefix database. The snapshot is constructed once and passed
//! into the enrichment cache; a refreshed database file produces a new
//! snapshot rather than mutating one in place, so in-flight lookups never
//! observe a half-updated table.

use crate::error::{IngestError, Result};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct GeoEntryRaw {
    network: String,
    country: String,
}

#[derive(Debug, Clone)]
struct GeoEntry {
    base: IpAddr,
    prefix_len: u8,
    country: String,
}

/// Immutable IP-prefix to country-code table.
#[derive(Debug, Clone, Default)]
pub struct GeoSnapshot {
    entries: Vec<GeoEntry>,
}

impl GeoSnapshot {
    /// Loads the snapshot from a JSON database file:
    /// `[{"network": "203.0.113.0/24", "country": "AU"}, ...]`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path)?;
        let raw: Vec<GeoEntryRaw> = serde_json::from_slice(&data)
            .map_err(|e| IngestError::Format(format!("geo database: {}", e)))?;
        let mut entries = Vec::with_capacity(raw.len());
        for entry in raw {
            let (base, prefix_len) = parse_network(&entry.network)?;
            entries.push(GeoEntry { base, prefix_len, country: entry.country });
        }
        Ok(GeoSnapshot { entries })
    }

    /// An empty snapshot; every lookup misses.
    pub fn empty() -> Self {
        GeoSnapshot::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Longest-prefix country lookup.
    pub fn country(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .filter(|e| network_contains(e.base, e.prefix_len, ip))
            .max_by_key(|e| e.prefix_len)
            .map(|e| e.country.clone())
    }
}

fn parse_network(network: &str) -> Result<(IpAddr, u8)> {
    let (addr, len) = network
        .split_once('/')
        .ok_or_else(|| IngestError::Format(format!("bad network: {}", network)))?;
    let base: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| IngestError::Format(format!("bad network address: {}", network)))?;
    let prefix_len: u8 = len
        .trim()
        .parse()
        .map_err(|_| IngestError::Format(format!("bad prefix length: {}", network)))?;
    let max = match base {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix_len > max {
        return Err(IngestError::Format(format!("bad prefix length: {}", network)));
    }
    Ok((base, prefix_len))
}

fn network_contains(base: IpAddr, prefix_len: u8, ip: IpAddr) -> bool {
    match (base, ip) {
        (IpAddr::V4(base), IpAddr::V4(ip)) => {
            if prefix_len == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix_len as u32);
            u32::from(base) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(base), IpAddr::V6(ip)) => {
            if prefix_len == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix_len as u32);
            u128::from(base) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn snapshot_from(entries: &str) -> GeoSnapshot {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geo.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(entries.as_bytes()).unwrap();
        GeoSnapshot::load(&path).unwrap()
    }

    #[test]
    fn test_prefix_lookup() {
        let geo = snapshot_from(
            r#"[{"network": "203.0.113.0/24", "country": "AU"},
                {"network": "198.51.100.0/24", "country": "NL"}]"#,
        );
        assert_eq!(geo.country("203.0.113.5".parse().unwrap()), Some("AU".to_string()));
        assert_eq!(geo.country("198.51.100.200".parse().unwrap()), Some("NL".to_string()));
        assert_eq!(geo.country("192.0.2.1".parse().unwrap()), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let geo = snapshot_from(
            r#"[{"network": "10.0.0.0/8", "country": "US"},
                {"network": "10.1.0.0/16", "country": "DE"}]"#,
        );
        assert_eq!(geo.country("10.1.2.3".parse().unwrap()), Some("DE".to_string()));
        assert_eq!(geo.country("10.2.2.3".parse().unwrap()), Some("US".to_string()));
    }

    #[test]
    fn test_rejects_malformed_networks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geo.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"[{"network": "203.0.113.0/40", "country": "AU"}]"#).unwrap();
        assert!(GeoSnapshot::load(&path).is_err());
    }

    #[test]
    fn test_empty_snapshot_misses() {
        assert_eq!(GeoSnapshot::empty().country("8.8.8.8".parse().unwrap()), None);
    }
}
