//! Diagnostic drivers shipped with the worker. They touch nothing outside the
//! engine, so a deployment can be exercised end to end before real drivers
//! are plugged in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use catscan_core::{
    CatalogScanDriver, DriverRegistry, LeafDriver, LeafOutcome, PageScanResult, RegisteredDriver,
};
use catscan_model::{IndexScan, IndexScanMode, LeafScan, PageScan};
use tracing::info;

pub const LOG_LEAVES: &str = "log-leaves";
pub const LOG_LATEST_LEAVES: &str = "log-latest-leaves";
pub const COUNT_PAGES: &str = "count-pages";

pub fn registry() -> DriverRegistry {
    let mut drivers = DriverRegistry::new();
    drivers.register(
        LOG_LEAVES,
        RegisteredDriver::with_leaf_driver(Arc::new(LeafLogger::new(IndexScanMode::Expand))),
    );
    drivers.register(
        LOG_LATEST_LEAVES,
        RegisteredDriver::with_leaf_driver(Arc::new(LeafLogger::new(
            IndexScanMode::ExpandLatestLeaves,
        ))),
    );
    drivers.register(COUNT_PAGES, RegisteredDriver::new(Arc::new(PageCounter::default())));
    drivers
}

/// Logs every leaf it is handed.
#[derive(Debug)]
pub struct LeafLogger {
    mode: IndexScanMode,
    leaves: AtomicU64,
}

impl LeafLogger {
    pub fn new(mode: IndexScanMode) -> Self {
        Self {
            mode,
            leaves: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl CatalogScanDriver for LeafLogger {
    async fn process_index(&self, _scan: &IndexScan) -> anyhow::Result<IndexScanMode> {
        Ok(self.mode)
    }

    async fn process_page(&self, _page: &PageScan) -> anyhow::Result<PageScanResult> {
        Ok(PageScanResult::ExpandAllowDuplicates)
    }

    async fn finalize(&self, scan: &IndexScan) -> anyhow::Result<()> {
        info!(
            target: "catscan::drivers",
            scan_id = %scan.scan_id,
            driver = %scan.driver_type,
            leaves = self.leaves.swap(0, Ordering::Relaxed),
            "leaf logger finished"
        );
        Ok(())
    }
}

#[async_trait]
impl LeafDriver for LeafLogger {
    async fn process_leaf(&self, leaf: &LeafScan) -> anyhow::Result<LeafOutcome> {
        self.leaves.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "catscan::drivers",
            package_id = %leaf.package_id,
            version = %leaf.package_version,
            leaf_type = ?leaf.leaf_type,
            commit = %leaf.commit_timestamp,
            url = %leaf.url,
            "catalog leaf"
        );
        Ok(LeafOutcome::Success)
    }
}

/// Handles each page itself and only counts them.
#[derive(Debug, Default)]
pub struct PageCounter {
    pages: AtomicU64,
}

#[async_trait]
impl CatalogScanDriver for PageCounter {
    async fn process_index(&self, _scan: &IndexScan) -> anyhow::Result<IndexScanMode> {
        Ok(IndexScanMode::Expand)
    }

    async fn process_page(&self, page: &PageScan) -> anyhow::Result<PageScanResult> {
        let seen = self.pages.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            target: "catscan::drivers",
            page_id = %page.page_id,
            url = %page.url,
            seen,
            "catalog page"
        );
        Ok(PageScanResult::Processed)
    }

    async fn finalize(&self, scan: &IndexScan) -> anyhow::Result<()> {
        info!(
            target: "catscan::drivers",
            scan_id = %scan.scan_id,
            pages = self.pages.swap(0, Ordering::Relaxed),
            "page counter finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catscan_model::DriverType;

    #[test]
    fn registry_lists_diagnostic_drivers() {
        let drivers = registry();
        for name in [LOG_LEAVES, LOG_LATEST_LEAVES, COUNT_PAGES] {
            assert!(drivers.contains(&DriverType::from(name)), "{name} missing");
        }
        assert!(drivers.leaf_driver(&DriverType::from(COUNT_PAGES)).is_err());
        assert!(drivers.leaf_driver(&DriverType::from(LOG_LEAVES)).is_ok());
    }
}
