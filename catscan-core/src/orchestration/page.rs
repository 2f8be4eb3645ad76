use std::time::Duration;

use catscan_model::{LeafScan, LeafScanMessage, PageScan, PageScanMessage, PageScanState};
use tracing::{debug, info, warn};

use super::expander;
use crate::driver::PageScanResult;
use crate::engine::ScanEngine;
use crate::error::Result;
use crate::storage::WriteOutcome;

/// Drives one page scan: asks the driver what to do with the page, then
/// either drops the page or fans it out into leaf records.
#[derive(Clone, Debug)]
pub struct PageScanProcessor {
    engine: ScanEngine,
}

impl PageScanProcessor {
    pub fn new(engine: ScanEngine) -> Self {
        Self { engine }
    }

    pub async fn process(&self, message: &PageScanMessage) -> Result<()> {
        let storage = &self.engine.storage;
        let Some(mut page) = storage
            .get_page_scan(&message.storage_suffix, &message.scan_id, &message.page_id)
            .await?
        else {
            warn!(
                target: "catscan::page",
                scan_id = %message.scan_id,
                page_id = %message.page_id,
                "no page scan record for message; dropping"
            );
            return Ok(());
        };

        let driver = self.engine.drivers.scan_driver(&page.driver_type)?;
        let latest_only = match driver.process_page(&page).await? {
            PageScanResult::Processed => {
                storage.delete_page_scan(&page).await?;
                debug!(
                    target: "catscan::page",
                    scan_id = %page.scan_id,
                    page_id = %page.page_id,
                    "page processed by driver"
                );
                return Ok(());
            }
            PageScanResult::ExpandAllowDuplicates => false,
            PageScanResult::ExpandRemoveDuplicates => true,
        };

        let mut leaves: Option<Vec<LeafScan>> = None;
        loop {
            let next = match page.state {
                PageScanState::Created => PageScanState::Expanding,
                PageScanState::Expanding => {
                    let fresh = self.leaves(&page, latest_only, &mut leaves).await?;
                    expander::expand_leaves(storage, &page, fresh).await?;
                    PageScanState::Enqueuing
                }
                PageScanState::Enqueuing => {
                    let fresh = self.leaves(&page, latest_only, &mut leaves).await?;
                    let messages: Vec<LeafScanMessage> =
                        fresh.iter().map(|leaf| leaf.message()).collect();
                    self.engine.enqueue(messages, Duration::ZERO).await?;
                    PageScanState::Complete
                }
                PageScanState::Complete => {
                    storage.delete_page_scan(&page).await?;
                    return Ok(());
                }
            };

            page.state = next;
            match storage.replace_page_scan(&mut page).await? {
                WriteOutcome::Written(_) => {}
                WriteOutcome::Conflict | WriteOutcome::Missing => {
                    debug!(
                        target: "catscan::page",
                        scan_id = %page.scan_id,
                        page_id = %page.page_id,
                        "page scan changed underneath this invocation; stopping"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Leaf records for the page, computed at most once per invocation.
    async fn leaves<'m>(
        &self,
        page: &PageScan,
        latest_only: bool,
        memo: &'m mut Option<Vec<LeafScan>>,
    ) -> Result<&'m [LeafScan]> {
        let leaves = match memo.take() {
            Some(leaves) => leaves,
            None => {
                info!(target: "catscan::page", url = %page.url, "loading catalog page");
                let catalog_page = self.engine.catalog.get_page(&page.url).await?;
                let leaves = expander::leaf_scans(page, &catalog_page, latest_only);
                info!(
                    target: "catscan::page",
                    scan_id = %page.scan_id,
                    page_id = %page.page_id,
                    leaves = leaves.len(),
                    min = %page.min,
                    max = %page.max,
                    "expanding page"
                );
                leaves
            }
        };
        Ok(memo.insert(leaves).as_slice())
    }
}
