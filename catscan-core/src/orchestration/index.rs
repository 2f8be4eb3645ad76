//! Index scan state machine. Every invocation loads the persisted record,
//! runs the handler for its state, persists the advance and loops until the
//! scan has to wait or is finished.

use std::sync::Arc;
use std::time::Duration;

use catscan_model::{
    CatalogIndex, IndexScan, IndexScanMessage, IndexScanMode, IndexScanState, LeafScanMessage,
    PageScanMessage, epoch,
};
use tracing::{debug, info, warn};

use super::expander;
use crate::cursor::{CursorService, StartOutcome};
use crate::driver::CatalogScanDriver;
use crate::engine::ScanEngine;
use crate::error::Result;
use crate::storage::WriteOutcome;

#[derive(Debug)]
enum Step {
    Advance(IndexScanState),
    /// Children are not done yet; check again later.
    Requeue,
}

/// Catalog index fetched at most once per invocation.
#[derive(Default)]
struct IndexMemo {
    index: Option<CatalogIndex>,
}

impl IndexMemo {
    async fn get(&mut self, engine: &ScanEngine) -> Result<&CatalogIndex> {
        let index = match self.index.take() {
            Some(index) => index,
            None => engine.catalog.get_index().await?,
        };
        Ok(&*self.index.insert(index))
    }
}

#[derive(Clone, Debug)]
pub struct IndexScanProcessor {
    engine: ScanEngine,
    cursors: CursorService,
}

impl IndexScanProcessor {
    pub fn new(engine: ScanEngine, cursors: CursorService) -> Self {
        Self { engine, cursors }
    }

    pub async fn process(&self, message: &IndexScanMessage) -> Result<()> {
        let storage = &self.engine.storage;
        let Some(mut scan) = storage
            .get_index_scan(&message.cursor_name, &message.scan_id)
            .await?
        else {
            warn!(
                target: "catscan::index",
                cursor = %message.cursor_name,
                scan_id = %message.scan_id,
                "no index scan record for message; dropping"
            );
            return Ok(());
        };

        let driver = self.engine.drivers.scan_driver(&scan.driver_type)?;
        let mut memo = IndexMemo::default();
        let mut attempt = message.attempt_count;

        while !scan.state.is_terminal() {
            let step = match scan.state {
                IndexScanState::Created => self.created(&mut scan, &driver, &mut memo).await?,
                IndexScanState::WaitingOnDependency => self.waiting_on_dependency(&scan).await?,
                IndexScanState::Expanding => self.expanding(&scan, &mut memo).await?,
                IndexScanState::Enqueuing => {
                    attempt = 0;
                    self.enqueuing(&scan, &mut memo).await?
                }
                IndexScanState::Waiting => self.waiting(&scan).await?,
                IndexScanState::StartingAggregate => {
                    driver.start_aggregate(&scan).await?;
                    Step::Advance(IndexScanState::Aggregating)
                }
                IndexScanState::Aggregating => {
                    if driver.is_aggregate_complete(&scan).await? {
                        Step::Advance(IndexScanState::Finalizing)
                    } else {
                        Step::Requeue
                    }
                }
                IndexScanState::Finalizing => self.finalizing(&mut scan, &driver).await?,
                IndexScanState::Complete | IndexScanState::Aborted => break,
            };

            match step {
                Step::Advance(next) => {
                    let previous = scan.state;
                    scan.state = next;
                    match storage.replace_index_scan(&mut scan).await? {
                        WriteOutcome::Written(_) => debug!(
                            target: "catscan::index",
                            scan_id = %scan.scan_id,
                            from = %previous,
                            to = %next,
                            "index scan advanced"
                        ),
                        WriteOutcome::Conflict | WriteOutcome::Missing => {
                            debug!(
                                target: "catscan::index",
                                scan_id = %scan.scan_id,
                                state = %previous,
                                "index scan changed underneath this invocation; stopping"
                            );
                            return Ok(());
                        }
                    }
                }
                Step::Requeue => {
                    let next_attempt = attempt.saturating_add(1);
                    let delay = self.engine.config.poll.delay(next_attempt);
                    let mut again = scan.message();
                    again.attempt_count = next_attempt;
                    debug!(
                        target: "catscan::index",
                        scan_id = %scan.scan_id,
                        state = %scan.state,
                        attempts = next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "children still pending; requeueing"
                    );
                    self.engine.enqueue(vec![again], delay).await?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    async fn created(
        &self,
        scan: &mut IndexScan,
        driver: &Arc<dyn CatalogScanDriver>,
        memo: &mut IndexMemo,
    ) -> Result<Step> {
        let mode = match scan.mode {
            Some(mode) => mode,
            None => driver.process_index(scan).await?,
        };
        scan.mode = Some(mode);

        let index = memo.get(&self.engine).await?;
        let min = scan.min.unwrap_or_else(epoch);
        let mut max = match scan.max {
            Some(max) => max.min(index.commit_timestamp),
            None => index.commit_timestamp,
        };
        if max < min {
            warn!(
                target: "catscan::index",
                scan_id = %scan.scan_id,
                %min,
                %max,
                "catalog is behind the scan's lower bound; clamping max to min"
            );
            max = min;
        }
        scan.min = Some(min);
        scan.max = Some(max);
        scan.started = Some(self.engine.now());

        info!(
            target: "catscan::index",
            scan_id = %scan.scan_id,
            driver = %scan.driver_type,
            ?mode,
            %min,
            %max,
            "index scan bounds resolved"
        );

        Ok(Step::Advance(match mode {
            IndexScanMode::Expand => IndexScanState::Expanding,
            IndexScanMode::ExpandLatestLeaves => IndexScanState::WaitingOnDependency,
            IndexScanMode::Processed => IndexScanState::StartingAggregate,
        }))
    }

    async fn waiting_on_dependency(&self, scan: &IndexScan) -> Result<Step> {
        let Some(child) = self.cursors.get_or_start_find_latest(scan).await? else {
            return Ok(Step::Requeue);
        };
        if child.state == IndexScanState::Complete {
            Ok(Step::Advance(IndexScanState::Expanding))
        } else {
            Ok(Step::Requeue)
        }
    }

    async fn expanding(&self, scan: &IndexScan, memo: &mut IndexMemo) -> Result<Step> {
        match scan.mode {
            Some(IndexScanMode::ExpandLatestLeaves) => {
                let child_id = scan.scan_id.find_latest_child();
                if let Some(child) = self.engine.storage.get_index_scan("", &child_id).await? {
                    self.engine.storage.delete_index_scan(&child).await?;
                }
            }
            _ => {
                let index = memo.get(&self.engine).await?;
                let pages = expander::page_scans(scan, index);
                expander::expand_pages(&self.engine.storage, scan, &pages).await?;
            }
        }
        Ok(Step::Advance(IndexScanState::Enqueuing))
    }

    async fn enqueuing(&self, scan: &IndexScan, memo: &mut IndexMemo) -> Result<Step> {
        match scan.mode {
            Some(IndexScanMode::ExpandLatestLeaves) => {
                let messages: Vec<LeafScanMessage> = self
                    .engine
                    .storage
                    .list_leaf_scans(&scan.storage_suffix, &scan.scan_id)
                    .await?
                    .iter()
                    .map(|leaf| leaf.message())
                    .collect();
                info!(
                    target: "catscan::index",
                    scan_id = %scan.scan_id,
                    leaves = messages.len(),
                    "enqueuing latest leaves"
                );
                self.engine.enqueue(messages, Duration::ZERO).await?;
            }
            _ => {
                let index = memo.get(&self.engine).await?;
                let messages: Vec<PageScanMessage> = expander::page_scans(scan, index)
                    .iter()
                    .map(|page| page.message())
                    .collect();
                info!(
                    target: "catscan::index",
                    scan_id = %scan.scan_id,
                    pages = messages.len(),
                    "enqueuing pages"
                );
                self.engine.enqueue(messages, Duration::ZERO).await?;
            }
        }
        Ok(Step::Advance(IndexScanState::Waiting))
    }

    async fn waiting(&self, scan: &IndexScan) -> Result<Step> {
        let storage = &self.engine.storage;
        let pages = storage
            .page_scan_count_lower_bound(&scan.storage_suffix, &scan.scan_id)
            .await?;
        if pages > 0 {
            return Ok(Step::Requeue);
        }
        let leaves = storage
            .leaf_scan_count_lower_bound(&scan.storage_suffix, &scan.scan_id)
            .await?;
        if leaves > 0 {
            return Ok(Step::Requeue);
        }
        Ok(Step::Advance(IndexScanState::StartingAggregate))
    }

    async fn finalizing(
        &self,
        scan: &mut IndexScan,
        driver: &Arc<dyn CatalogScanDriver>,
    ) -> Result<Step> {
        driver.finalize(scan).await?;

        if !scan.storage_suffix.is_empty() {
            self.engine
                .storage
                .delete_child_tables(&scan.storage_suffix)
                .await?;
        }
        if !scan.cursor_name.is_empty()
            && let Some(max) = scan.max
        {
            self.cursors.advance_cursor(&scan.cursor_name, max).await?;
            if scan.continue_update {
                let outcomes = self.cursors.update_all(Some(max)).await?;
                let started = outcomes
                    .iter()
                    .filter(|(_, outcome)| matches!(outcome, Ok(StartOutcome::NewStarted { .. })))
                    .count();
                debug!(
                    target: "catscan::index",
                    scan_id = %scan.scan_id,
                    started,
                    "continued update after scan"
                );
            }
        }
        if !scan.cursor_name.is_empty() {
            let deleted = self
                .engine
                .storage
                .prune_index_scans(
                    &scan.cursor_name,
                    &scan.scan_id,
                    self.engine.config.old_index_scans_to_keep,
                )
                .await?;
            if deleted > 0 {
                info!(
                    target: "catscan::index",
                    cursor = %scan.cursor_name,
                    deleted,
                    "deleted old index scans"
                );
            }
        }

        scan.completed = Some(self.engine.now());
        info!(
            target: "catscan::index",
            scan_id = %scan.scan_id,
            driver = %scan.driver_type,
            "index scan complete"
        );
        Ok(Step::Advance(IndexScanState::Complete))
    }
}
