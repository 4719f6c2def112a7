//! Geo-IP lookup.
//!
//! The dispatcher only depends on the [`GeoLookup`] trait. [`GeoDatabase`] is
//! the bundled implementation: a sorted table of IPv4 ranges loaded from a
//! JSON file.
//!
//! ```json
//! [
//!   { "start": "1.0.1.0", "end": "1.0.3.255", "city": "Fuzhou", "city_id": 350100,
//!     "province": "Fujian", "region": "CN", "isp": "Telecom" }
//! ]
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// IP-derived location attributes attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoInfo {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub city_id: i64,
    #[serde(default)]
    pub province: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub isp: String,
}

impl GeoInfo {
    /// Pipe-separated form used by the `region_raw` field.
    pub fn raw(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GeoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.region, self.province, self.city, self.city_id, self.isp
        )
    }
}

/// Errors that can occur during geo-IP lookups.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("no region found for {0}")]
    NotFound(String),

    #[error("failed to read geo database: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse geo database: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolves an IP address string to location attributes.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: &str) -> Result<GeoInfo, GeoError>;
}

#[derive(Debug, Deserialize)]
struct RangeRecord {
    start: Ipv4Addr,
    end: Ipv4Addr,
    #[serde(flatten)]
    info: GeoInfo,
}

/// In-memory IPv4 range table.
#[derive(Debug, Default)]
pub struct GeoDatabase {
    /// (start, end, info), sorted by start, non-overlapping.
    ranges: Vec<(u32, u32, GeoInfo)>,
}

impl GeoDatabase {
    /// Load the range table from a JSON file.
    pub fn open(path: &Path) -> Result<Self, GeoError> {
        let text = std::fs::read_to_string(path)?;
        let db = Self::from_json(&text)?;
        tracing::info!(path = %path.display(), ranges = db.len(), "Geo database loaded");
        Ok(db)
    }

    /// Build the range table from JSON text.
    pub fn from_json(text: &str) -> Result<Self, GeoError> {
        let records: Vec<RangeRecord> = serde_json::from_str(text)?;
        let mut ranges: Vec<(u32, u32, GeoInfo)> = records
            .into_iter()
            .filter(|r| u32::from(r.start) <= u32::from(r.end))
            .map(|r| (u32::from(r.start), u32::from(r.end), r.info))
            .collect();
        ranges.sort_by_key(|(start, _, _)| *start);
        Ok(Self { ranges })
    }

    /// Number of ranges in the table.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl GeoLookup for GeoDatabase {
    fn lookup(&self, ip: &str) -> Result<GeoInfo, GeoError> {
        let addr: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| GeoError::InvalidAddress(ip.to_string()))?;
        let key = u32::from(addr);

        // Last range whose start <= key.
        let idx = self.ranges.partition_point(|(start, _, _)| *start <= key);
        match idx.checked_sub(1).map(|i| &self.ranges[i]) {
            Some((_, end, info)) if key <= *end => Ok(info.clone()),
            _ => Err(GeoError::NotFound(ip.to_string())),
        }
    }
}
