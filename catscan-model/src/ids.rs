use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Number of 100ns ticks between 0001-01-01 and the Unix epoch. Scan ids keep
/// this tick base so ids minted by older deployments still sort correctly.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Name of a registered driver. Also the suffix of its cursor name.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DriverType(String);

impl DriverType {
    /// Internal pre-pass that computes the latest leaf per package identity.
    pub const FIND_LATEST_LEAVES: &'static str = "find-latest-leaves";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn find_latest_leaves() -> Self {
        Self::new(Self::FIND_LATEST_LEAVES)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cursor tracking the high-water mark of this driver.
    pub fn cursor_name(&self) -> String {
        format!("CatalogScan-{}", self.0)
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DriverType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of an index scan. The leading component counts down with time
/// so a lexical listing returns the newest scan first; the trailing component
/// is unique and doubles as the storage suffix of the scan's child tables.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ScanId(String);

impl ScanId {
    pub fn descending(at: DateTime<Utc>) -> Self {
        let unique = Uuid::new_v4().simple().to_string();
        Self::descending_with(at, &unique[..16])
    }

    pub fn descending_with(at: DateTime<Utc>, unique: &str) -> Self {
        let ticks = UNIX_EPOCH_TICKS + at.timestamp_micros() * 10;
        let descending = i64::MAX - ticks;
        Self(format!("{descending:020}-{unique}"))
    }

    /// Trailing unique component.
    pub fn unique_part(&self) -> &str {
        self.0.split_once('-').map(|(_, rest)| rest).unwrap_or("")
    }

    /// Id of the find-latest-leaves pre-pass started on behalf of this scan.
    pub fn find_latest_child(&self) -> Self {
        Self(format!("{}-fl", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ScanId {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self> {
        let Some((descending, unique)) = raw.split_once('-') else {
            return Err(ModelError::InvalidScanId(raw.to_string()));
        };
        if descending.len() != 20
            || !descending.bytes().all(|b| b.is_ascii_digit())
            || unique.is_empty()
        {
            return Err(ModelError::InvalidScanId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }
}

pub fn page_id(rank: u32) -> String {
    format!("P{rank:010}")
}

pub fn leaf_id(rank: u32) -> String {
    format!("L{rank:010}")
}

/// Parses the rank out of a `P`/`L` prefixed id.
pub fn parse_rank(id: &str) -> Result<u32> {
    let digits = id
        .strip_prefix('P')
        .or_else(|| id.strip_prefix('L'))
        .filter(|digits| digits.len() == 10)
        .ok_or_else(|| ModelError::InvalidRankedId(id.to_string()))?;
    digits
        .parse()
        .map_err(|_| ModelError::InvalidRankedId(id.to_string()))
}
