//! Duplicate-safe fan-out of an index scan into pages and of a page into
//! leaves. Children are matched to existing records by URL so repeating an
//! expansion only inserts what is missing.

use std::collections::HashSet;

use catscan_model::{
    CatalogIndex, CatalogPage, IndexScan, LeafScan, PageScan, PageScanState, epoch, leaf_id,
    page_id,
};
use tracing::debug;

use crate::error::{Result, ScanError};
use crate::storage::CatalogScanStorage;

/// A child record with a natural key.
pub trait ChildRecord: Clone {
    fn url(&self) -> &str;
}

impl ChildRecord for PageScan {
    fn url(&self) -> &str {
        &self.url
    }
}

impl ChildRecord for LeafScan {
    fn url(&self) -> &str {
        &self.url
    }
}

/// Children of `fresh` with no existing record. Existing records that the
/// fresh list does not account for mean the inputs changed underneath the
/// scan, which is fatal.
pub fn missing_children<T: ChildRecord>(fresh: &[T], existing: &[T]) -> Result<Vec<T>> {
    let fresh_urls: HashSet<&str> = fresh.iter().map(ChildRecord::url).collect();
    if existing.len() > fresh.len() {
        return Err(ScanError::invariant(format!(
            "found {} existing children but only {} expected",
            existing.len(),
            fresh.len()
        )));
    }
    if let Some(stray) = existing.iter().find(|child| !fresh_urls.contains(child.url())) {
        return Err(ScanError::invariant(format!(
            "existing child {} is not part of the expansion",
            stray.url()
        )));
    }

    let existing_urls: HashSet<&str> = existing.iter().map(ChildRecord::url).collect();
    Ok(fresh
        .iter()
        .filter(|child| !existing_urls.contains(child.url()))
        .cloned()
        .collect())
}

/// Page records for every catalog page overlapping the scan window.
pub fn page_scans(scan: &IndexScan, index: &CatalogIndex) -> Vec<PageScan> {
    let min = scan.min.unwrap_or_else(epoch);
    let max = scan.max.unwrap_or(index.commit_timestamp);
    let ranks = index.page_ranks();

    index
        .pages_in_bounds(min, max)
        .into_iter()
        .map(|item| {
            let rank = ranks.get(item.url.as_str()).copied().unwrap_or_default();
            PageScan {
                storage_suffix: scan.storage_suffix.clone(),
                scan_id: scan.scan_id.clone(),
                page_id: page_id(rank),
                state: PageScanState::Created,
                url: item.url.clone(),
                rank,
                driver_type: scan.driver_type.clone(),
                driver_parameters: scan.driver_parameters.clone(),
                min,
                max,
                version: 0,
            }
        })
        .collect()
}

/// Leaf records for the page's leaves in bounds.
pub fn leaf_scans(page: &PageScan, catalog_page: &CatalogPage, latest_only: bool) -> Vec<LeafScan> {
    let ranks = catalog_page.leaf_ranks();
    let mut leaves: Vec<LeafScan> = catalog_page
        .leaves_in_bounds(page.min, page.max, latest_only)
        .into_iter()
        .map(|item| {
            let rank = ranks.get(item.url.as_str()).copied().unwrap_or_default();
            LeafScan {
                storage_suffix: page.storage_suffix.clone(),
                scan_id: page.scan_id.clone(),
                page_id: page.page_id.clone(),
                leaf_id: leaf_id(rank),
                url: item.url.clone(),
                leaf_type: item.leaf_type,
                commit_id: item.commit_id.clone(),
                commit_timestamp: item.commit_timestamp,
                package_id: item.package_id.clone(),
                package_version: item.package_version.clone(),
                driver_type: page.driver_type.clone(),
                driver_parameters: page.driver_parameters.clone(),
                min: page.min,
                max: page.max,
                attempt_count: 0,
                next_attempt: None,
                version: 0,
            }
        })
        .collect();
    leaves.sort_by(|a, b| a.leaf_id.cmp(&b.leaf_id));
    leaves
}

pub async fn expand_pages(
    storage: &CatalogScanStorage,
    scan: &IndexScan,
    fresh: &[PageScan],
) -> Result<usize> {
    let existing = storage
        .list_page_scans(&scan.storage_suffix, &scan.scan_id)
        .await?;
    let missing = missing_children(fresh, &existing)?;
    let inserted = storage.insert_page_scans(&missing).await?;
    debug!(
        target: "catscan::index",
        scan_id = %scan.scan_id,
        fresh = fresh.len(),
        existing = existing.len(),
        inserted,
        "expanded index scan into pages"
    );
    Ok(inserted)
}

pub async fn expand_leaves(
    storage: &CatalogScanStorage,
    page: &PageScan,
    fresh: &[LeafScan],
) -> Result<usize> {
    let existing = storage
        .list_page_leaf_scans(&page.storage_suffix, &page.scan_id, &page.page_id)
        .await?;
    let missing = missing_children(fresh, &existing)?;
    let inserted = storage.insert_leaf_scans(&missing).await?;
    debug!(
        target: "catscan::page",
        scan_id = %page.scan_id,
        page_id = %page.page_id,
        fresh = fresh.len(),
        existing = existing.len(),
        inserted,
        "expanded page scan into leaves"
    );
    Ok(inserted)
}
