//! Internal pre-pass that reduces a window of the catalog to the latest
//! leaf per package identity, written straight into the parent scan's leaf
//! table.

use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use catscan_model::{
    CatalogLeafItem, IndexScan, IndexScanMode, LeafScan, PackageIdentity, PageScan,
    ParentScan,
};
use tracing::debug;

use super::{CatalogScanDriver, PageScanResult};
use crate::catalog::CatalogSource;
use crate::storage::{CatalogScanStorage, WriteOutcome};

const MAX_UPSERT_ATTEMPTS: usize = 5;

#[derive(Clone, Debug)]
pub struct FindLatestLeavesDriver {
    storage: CatalogScanStorage,
    catalog: Arc<dyn CatalogSource>,
}

impl FindLatestLeavesDriver {
    pub fn new(storage: CatalogScanStorage, catalog: Arc<dyn CatalogSource>) -> Self {
        Self { storage, catalog }
    }

    fn parent_leaf(parent: &ParentScan, page: &PageScan, item: &CatalogLeafItem) -> LeafScan {
        let identity = PackageIdentity::of(item);
        LeafScan {
            storage_suffix: parent.storage_suffix.clone(),
            scan_id: parent.scan_id.clone(),
            page_id: identity.id,
            leaf_id: identity.version,
            url: item.url.clone(),
            leaf_type: item.leaf_type,
            commit_id: item.commit_id.clone(),
            commit_timestamp: item.commit_timestamp,
            package_id: item.package_id.clone(),
            package_version: item.package_version.clone(),
            driver_type: parent.driver_type.clone(),
            driver_parameters: parent.driver_parameters.clone(),
            min: page.min,
            max: page.max,
            attempt_count: 0,
            next_attempt: None,
            version: 0,
        }
    }

    /// Inserts the leaf, or replaces the stored one when this leaf's commit
    /// is newer. Older or equal commits leave the stored leaf alone.
    async fn upsert_latest(&self, mut leaf: LeafScan) -> anyhow::Result<()> {
        for _ in 0..MAX_UPSERT_ATTEMPTS {
            let existing = self
                .storage
                .get_leaf_scan(
                    &leaf.storage_suffix,
                    &leaf.scan_id,
                    &leaf.page_id,
                    &leaf.leaf_id,
                )
                .await?;

            match existing {
                None => {
                    if self.storage.insert_leaf_scan(&mut leaf).await? {
                        return Ok(());
                    }
                }
                Some(existing) if existing.commit_timestamp >= leaf.commit_timestamp => {
                    return Ok(());
                }
                Some(existing) => {
                    leaf.version = existing.version;
                    match self.storage.replace_leaf_scan(&mut leaf).await? {
                        WriteOutcome::Written(_) => return Ok(()),
                        WriteOutcome::Conflict | WriteOutcome::Missing => {}
                    }
                }
            }
            debug!(
                target: "catscan::page",
                page_id = %leaf.page_id,
                leaf_id = %leaf.leaf_id,
                "latest leaf changed concurrently; retrying"
            );
        }
        bail!(
            "gave up writing latest leaf {}/{} after {MAX_UPSERT_ATTEMPTS} attempts",
            leaf.page_id,
            leaf.leaf_id
        )
    }
}

#[async_trait]
impl CatalogScanDriver for FindLatestLeavesDriver {
    async fn process_index(&self, _scan: &IndexScan) -> anyhow::Result<IndexScanMode> {
        Ok(IndexScanMode::Expand)
    }

    async fn process_page(&self, page: &PageScan) -> anyhow::Result<PageScanResult> {
        let raw = page
            .driver_parameters
            .as_deref()
            .context("find-latest page is missing its parent scan")?;
        let parent: ParentScan =
            serde_json::from_str(raw).context("invalid parent scan parameters")?;

        let catalog_page = self.catalog.get_page(&page.url).await?;
        let latest = catalog_page.leaves_in_bounds(page.min, page.max, true);
        debug!(
            target: "catscan::page",
            scan_id = %page.scan_id,
            page_id = %page.page_id,
            parent = %parent.scan_id,
            leaves = latest.len(),
            "writing latest leaves into parent scan"
        );

        for item in latest {
            self.upsert_latest(Self::parent_leaf(&parent, page, item)).await?;
        }
        Ok(PageScanResult::Processed)
    }
}
