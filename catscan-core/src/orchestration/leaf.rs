//! Leaf retry governor. Decides per leaf message whether to poison it, push
//! it back until its not-before time, or run the driver, and keeps the
//! persisted attempt count in step with the queue's redelivery count.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use catscan_model::{DriverType, LeafScan, LeafScanMessage, ScanId};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::retry::leaf_backoff;
use crate::driver::BatchItemOutcome;
use crate::engine::ScanEngine;
use crate::error::{Result, ScanError};
use crate::storage::WriteOutcome;

/// One received leaf message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafDelivery {
    pub message: LeafScanMessage,
    pub dequeue_count: u32,
}

/// What became of one leaf message. Every variant except `Failed` settles
/// the delivery; `Failed` asks for redelivery after `retry_after`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafDisposition {
    Succeeded,
    /// No record matches the message.
    Missing,
    /// Same leaf appeared earlier in the batch.
    Duplicate,
    Poisoned,
    /// A copy of the message was enqueued to run after `delay`.
    Rescheduled { delay: Duration },
    Failed { retry_after: Duration, error: String },
}

impl LeafDisposition {
    pub fn settles_delivery(&self) -> bool {
        !matches!(self, LeafDisposition::Failed { .. })
    }
}

struct Candidate {
    index: usize,
    leaf: LeafScan,
    /// Attempt number this delivery counts as.
    attempts: u32,
    /// Attempt count read from storage, restored on `TryAgainLater`.
    persisted: u32,
}

#[derive(Default)]
struct Plan {
    dispositions: Vec<Option<LeafDisposition>>,
    poison: Vec<(usize, u32)>,
    reschedule: Vec<(usize, Duration)>,
    /// Per page group, the single driver type and the leaves to run.
    runs: Vec<(DriverType, Vec<Candidate>)>,
}

impl Plan {
    /// Marks every unsettled delivery in `indices` as failed.
    fn fail_unsettled(
        &mut self,
        indices: impl IntoIterator<Item = (usize, Duration)>,
        error: &str,
    ) {
        for (index, retry_after) in indices {
            let slot = &mut self.dispositions[index];
            if slot.is_none() {
                *slot = Some(LeafDisposition::Failed {
                    retry_after,
                    error: error.to_string(),
                });
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeafScanProcessor {
    engine: ScanEngine,
}

impl LeafScanProcessor {
    pub fn new(engine: ScanEngine) -> Self {
        Self { engine }
    }

    /// Handles a batch of leaf deliveries. Returns one disposition per
    /// delivery, in order. A failure inside one page group only fails that
    /// group's deliveries.
    pub async fn process_batch(&self, deliveries: &[LeafDelivery]) -> Vec<LeafDisposition> {
        let plan = self.plan(deliveries).await;
        self.execute(deliveries, plan).await
    }

    /// Reads the leaf records and sorts deliveries without side effects.
    async fn plan(&self, deliveries: &[LeafDelivery]) -> Plan {
        let retry = &self.engine.config.retry;
        let now = self.engine.now();

        let mut groups: BTreeMap<(&str, &ScanId, &str), Vec<usize>> = BTreeMap::new();
        for (index, delivery) in deliveries.iter().enumerate() {
            let message = &delivery.message;
            groups
                .entry((
                    message.storage_suffix.as_str(),
                    &message.scan_id,
                    message.page_id.as_str(),
                ))
                .or_default()
                .push(index);
        }

        let mut plan = Plan {
            dispositions: vec![None; deliveries.len()],
            ..Plan::default()
        };

        for ((suffix, scan_id, page_id), indices) in groups {
            let ids: HashSet<&str> = indices
                .iter()
                .map(|&i| deliveries[i].message.leaf_id.as_str())
                .collect();
            let mut records = match self
                .engine
                .storage
                .get_leaf_scans(suffix, scan_id, page_id, &ids)
                .await
            {
                Ok(records) => records,
                Err(err) => {
                    warn!(
                        target: "catscan::leaf",
                        %scan_id,
                        page_id,
                        "could not read leaf records: {err:#}"
                    );
                    let retry_after = retry.try_again_later();
                    plan.fail_unsettled(
                        indices.iter().map(|&i| (i, retry_after)),
                        &format!("{err:#}"),
                    );
                    continue;
                }
            };

            let mut candidates = Vec::new();
            let mut seen = HashSet::new();
            for index in indices {
                let delivery = &deliveries[index];
                let leaf_id = delivery.message.leaf_id.as_str();
                if !seen.insert(leaf_id) {
                    plan.dispositions[index] = Some(LeafDisposition::Duplicate);
                    continue;
                }
                let Some(leaf) = records.remove(leaf_id) else {
                    plan.dispositions[index] = Some(LeafDisposition::Missing);
                    continue;
                };

                let persisted = leaf.attempt_count;
                let attempts = persisted.saturating_add(1).max(delivery.dequeue_count);
                if attempts > retry.max_attempts {
                    plan.poison.push((index, attempts));
                    continue;
                }

                if let Some(next_attempt) = leaf.next_attempt
                    && next_attempt > now
                {
                    let remaining = (next_attempt - now).to_std().unwrap_or_default();
                    plan.reschedule
                        .push((index, remaining.min(retry.not_before_cap())));
                    continue;
                }

                candidates.push(Candidate {
                    index,
                    leaf,
                    attempts,
                    persisted,
                });
            }

            let driver_types: HashSet<&DriverType> =
                candidates.iter().map(|c| &c.leaf.driver_type).collect();
            if driver_types.len() > 1 {
                let err = ScanError::invariant(format!(
                    "scan {scan_id} page {page_id} mixes {} driver types",
                    driver_types.len()
                ));
                error!(target: "catscan::leaf", "{err}");
                plan.fail_unsettled(
                    candidates
                        .iter()
                        .map(|c| (c.index, leaf_backoff(retry, c.attempts))),
                    &err.to_string(),
                );
                continue;
            }
            if let Some(first) = candidates.first() {
                plan.runs.push((first.leaf.driver_type.clone(), candidates));
            }
        }

        plan
    }

    /// Runs reschedules, then each driver group, then poison sends. Errors
    /// only fail the deliveries they touch.
    async fn execute(&self, deliveries: &[LeafDelivery], mut plan: Plan) -> Vec<LeafDisposition> {
        let retry = self.engine.config.retry;

        for (index, delay) in std::mem::take(&mut plan.reschedule) {
            let delivery = &deliveries[index];
            debug!(
                target: "catscan::leaf",
                leaf_id = %delivery.message.leaf_id,
                delay_ms = delay.as_millis() as u64,
                "leaf not due yet; rescheduling"
            );
            match self.engine.enqueue(vec![delivery.message.clone()], delay).await {
                Ok(()) => plan.dispositions[index] = Some(LeafDisposition::Rescheduled { delay }),
                Err(err) => plan.fail_unsettled(
                    [(index, retry.try_again_later())],
                    &format!("{err:#}"),
                ),
            }
        }

        for (driver_type, candidates) in std::mem::take(&mut plan.runs) {
            let group: Vec<(usize, Duration)> = candidates
                .iter()
                .map(|c| (c.index, leaf_backoff(&retry, c.attempts)))
                .collect();
            if let Err(err) = self
                .run_driver(deliveries, &driver_type, candidates, &mut plan.dispositions)
                .await
            {
                warn!(
                    target: "catscan::leaf",
                    driver = %driver_type,
                    count = group.len(),
                    "leaf group failed: {err:#}"
                );
                let group = group.into_iter().map(|(index, backoff)| {
                    if err.is_transient() {
                        (index, retry.try_again_later())
                    } else {
                        (index, backoff)
                    }
                });
                plan.fail_unsettled(group, &format!("{err:#}"));
            }
        }

        for (index, attempts) in std::mem::take(&mut plan.poison) {
            let delivery = &deliveries[index];
            error!(
                target: "catscan::leaf",
                scan_id = %delivery.message.scan_id,
                page_id = %delivery.message.page_id,
                leaf_id = %delivery.message.leaf_id,
                attempts,
                dequeue_count = delivery.dequeue_count,
                "leaf exhausted its attempts; moving message to the poison queue"
            );
            match self
                .engine
                .queue
                .enqueue_poison(vec![delivery.message.clone().into()])
                .await
            {
                Ok(()) => plan.dispositions[index] = Some(LeafDisposition::Poisoned),
                Err(err) => plan.fail_unsettled(
                    [(index, retry.try_again_later())],
                    &format!("{err:#}"),
                ),
            }
        }

        plan.dispositions
            .into_iter()
            .map(|d| d.unwrap_or(LeafDisposition::Missing))
            .collect()
    }

    async fn run_driver(
        &self,
        deliveries: &[LeafDelivery],
        driver_type: &DriverType,
        candidates: Vec<Candidate>,
        dispositions: &mut [Option<LeafDisposition>],
    ) -> Result<()> {
        let driver = self.engine.drivers.leaf_driver(driver_type)?;
        let retry = self.engine.config.retry;
        let now = self.engine.now();

        let mut started: Vec<(usize, LeafScan, u32)> = Vec::with_capacity(candidates.len());
        for Candidate {
            index,
            mut leaf,
            attempts,
            persisted,
        } in candidates
        {
            let backoff = leaf_backoff(&retry, attempts);
            leaf.attempt_count = persisted.saturating_add(1);
            leaf.next_attempt = Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
            match self.engine.storage.replace_leaf_scan(&mut leaf).await? {
                WriteOutcome::Written(_) => started.push((index, leaf, persisted)),
                WriteOutcome::Missing => dispositions[index] = Some(LeafDisposition::Missing),
                WriteOutcome::Conflict => {
                    debug!(
                        target: "catscan::leaf",
                        leaf_id = %leaf.leaf_id,
                        "leaf changed while starting attempt"
                    );
                    dispositions[index] = Some(LeafDisposition::Failed {
                        retry_after: retry.try_again_later(),
                        error: "leaf scan changed while starting attempt".to_string(),
                    });
                }
            }
        }
        if started.is_empty() {
            return Ok(());
        }

        let leaves: Vec<LeafScan> = started.iter().map(|(_, leaf, _)| leaf.clone()).collect();
        info!(
            target: "catscan::leaf",
            driver = %driver_type,
            count = leaves.len(),
            "processing leaf batch"
        );

        let outcomes = match driver.process_leaves(&leaves).await {
            Ok(outcomes) if outcomes.len() == started.len() => outcomes,
            Ok(outcomes) => {
                return Err(ScanError::invariant(format!(
                    "driver {driver_type} returned {} outcomes for {} leaves",
                    outcomes.len(),
                    started.len()
                )));
            }
            Err(err) => {
                warn!(target: "catscan::leaf", driver = %driver_type, "leaf batch failed: {err:#}");
                let error = format!("{err:#}");
                vec![BatchItemOutcome::Failed(error); started.len()]
            }
        };

        for ((index, mut leaf, persisted), outcome) in started.into_iter().zip(outcomes) {
            let disposition = match outcome {
                BatchItemOutcome::Success => {
                    match self.engine.storage.delete_leaf_scan(&leaf).await? {
                        WriteOutcome::Conflict => debug!(
                            target: "catscan::leaf",
                            leaf_id = %leaf.leaf_id,
                            "leaf changed after success; leaving record in place"
                        ),
                        WriteOutcome::Written(_) | WriteOutcome::Missing => {}
                    }
                    LeafDisposition::Succeeded
                }
                BatchItemOutcome::TryAgainLater => {
                    leaf.attempt_count = persisted;
                    leaf.next_attempt = Some(now);
                    if !self.engine.storage.replace_leaf_scan(&mut leaf).await?.is_written() {
                        debug!(
                            target: "catscan::leaf",
                            leaf_id = %leaf.leaf_id,
                            "could not roll back attempt"
                        );
                    }
                    let delay = retry.try_again_later();
                    self.engine
                        .enqueue(vec![deliveries[index].message.clone()], delay)
                        .await?;
                    LeafDisposition::Rescheduled { delay }
                }
                BatchItemOutcome::Failed(error) => LeafDisposition::Failed {
                    retry_after: until(leaf.next_attempt, now),
                    error,
                },
            };
            dispositions[index] = Some(disposition);
        }
        Ok(())
    }
}

fn until(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    at.and_then(|at| (at - now).to_std().ok()).unwrap_or_default()
}
