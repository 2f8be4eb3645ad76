//! Documents served by the catalog feed and the rules used to select the
//! pages and leaves that fall inside a scan window.

use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change a catalog leaf describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeafType {
    #[serde(rename = "nuget:PackageDetails")]
    PackageDetails,
    #[serde(rename = "nuget:PackageDelete")]
    PackageDelete,
}

/// Root document of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogIndex {
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub count: Option<u32>,
    pub items: Vec<CatalogPageItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPageItem {
    #[serde(rename = "@id")]
    pub url: String,
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    #[serde(rename = "commitId", default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPage {
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    pub items: Vec<CatalogLeafItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogLeafItem {
    #[serde(rename = "@id")]
    pub url: String,
    #[serde(rename = "@type")]
    pub leaf_type: LeafType,
    #[serde(rename = "commitId")]
    pub commit_id: String,
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    #[serde(rename = "nuget:id")]
    pub package_id: String,
    #[serde(rename = "nuget:version")]
    pub package_version: String,
}

/// Case-insensitive package identity used to collapse duplicate leaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageIdentity {
    pub id: String,
    pub version: String,
}

impl PackageIdentity {
    pub fn new(id: &str, version: &str) -> Self {
        Self {
            id: id.to_lowercase(),
            version: normalize_version(version),
        }
    }

    pub fn of(leaf: &CatalogLeafItem) -> Self {
        Self::new(&leaf.package_id, &leaf.package_version)
    }
}

/// Lower-cases a version, drops build metadata and canonicalises the numeric
/// release segments (`1.0` and `1.0.0.0` both become `1.0.0`). Versions that
/// do not look numeric are only lower-cased.
pub fn normalize_version(version: &str) -> String {
    let lowered = version.trim().to_lowercase();
    let without_metadata = match lowered.split_once('+') {
        Some((head, _)) => head,
        None => lowered.as_str(),
    };
    let (release, prerelease) = match without_metadata.split_once('-') {
        Some((release, pre)) => (release, Some(pre)),
        None => (without_metadata, None),
    };

    let parsed: Option<Vec<u64>> = release
        .split('.')
        .map(|segment| segment.parse::<u64>().ok())
        .collect();
    let Some(mut numbers) = parsed.filter(|n| !n.is_empty() && n.len() <= 4)
    else {
        return without_metadata.to_string();
    };
    while numbers.len() < 3 {
        numbers.push(0);
    }
    if numbers.len() == 4 && numbers[3] == 0 {
        numbers.pop();
    }

    let mut normalized = numbers
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".");
    if let Some(pre) = prerelease {
        normalized.push('-');
        normalized.push_str(pre);
    }
    normalized
}

impl CatalogIndex {
    /// Rank of every page: its position when ordered by commit timestamp,
    /// ties broken by URL.
    pub fn page_ranks(&self) -> HashMap<&str, u32> {
        let mut ordered: Vec<&CatalogPageItem> = self.items.iter().collect();
        ordered.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.url.cmp(&b.url))
        });
        ordered
            .into_iter()
            .enumerate()
            .map(|(rank, item)| (item.url.as_str(), rank as u32))
            .collect()
    }

    /// Pages that may hold leaves in `(min, max]`, in commit order. Pages
    /// entirely at or before `min` are skipped; pages are taken until (and
    /// including) the first one whose commit timestamp reaches `max`.
    pub fn pages_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
    ) -> Vec<&CatalogPageItem> {
        let mut upper: Vec<&CatalogPageItem> = self
            .items
            .iter()
            .filter(|page| page.commit_timestamp > min)
            .collect();
        upper.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.url.cmp(&b.url))
        });

        let mut pages = Vec::new();
        for page in upper {
            let reached_max = page.commit_timestamp >= max;
            pages.push(page);
            if reached_max {
                break;
            }
        }
        pages
    }
}

impl CatalogPage {
    pub fn leaf_ranks(&self) -> HashMap<&str, u32> {
        let mut ordered: Vec<&CatalogLeafItem> = self.items.iter().collect();
        ordered.sort_by(|a, b| {
            a.commit_timestamp
                .cmp(&b.commit_timestamp)
                .then_with(|| a.url.cmp(&b.url))
        });
        ordered
            .into_iter()
            .enumerate()
            .map(|(rank, item)| (item.url.as_str(), rank as u32))
            .collect()
    }

    /// Leaves with `min < commit_timestamp <= max`, ordered by commit
    /// timestamp then package identity. With `latest_only`, only the last
    /// leaf (in catalog order) per package identity is kept.
    pub fn leaves_in_bounds(
        &self,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        latest_only: bool,
    ) -> Vec<&CatalogLeafItem> {
        let mut leaves: Vec<&CatalogLeafItem> = self
            .items
            .iter()
            .filter(|leaf| {
                leaf.commit_timestamp > min && leaf.commit_timestamp <= max
            })
            .collect();
        leaves.sort_by(|a, b| a.commit_timestamp.cmp(&b.commit_timestamp));

        if latest_only {
            let mut latest: HashMap<PackageIdentity, &CatalogLeafItem> =
                HashMap::new();
            for leaf in leaves {
                latest.insert(PackageIdentity::of(leaf), leaf);
            }
            leaves = latest.into_values().collect();
        }

        leaves.sort_by(|a, b| compare_leaves(a, b));
        leaves
    }
}

fn compare_leaves(a: &CatalogLeafItem, b: &CatalogLeafItem) -> Ordering {
    a.commit_timestamp
        .cmp(&b.commit_timestamp)
        .then_with(|| PackageIdentity::of(a).cmp(&PackageIdentity::of(b)))
        .then_with(|| a.url.cmp(&b.url))
}
