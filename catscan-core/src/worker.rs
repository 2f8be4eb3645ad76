//! Queue-driven worker runtime: receive, dispatch to the processor for the
//! message kind, then settle each delivery.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use catscan_model::ScanMessage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cursor::CursorService;
use crate::engine::ScanEngine;
use crate::error::{Result, ScanError};
use crate::orchestration::{
    IndexScanProcessor, LeafDelivery, LeafDisposition, LeafScanProcessor, PageScanProcessor,
};
use crate::queue::{Delivery, ReceiptId};

/// Outcome of dispatching a single index or page delivery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success,
    Retry { error: String },
    DeadLetter { error: String },
}

impl DispatchStatus {
    pub fn needs_retry(&self) -> bool {
        matches!(self, DispatchStatus::Retry { .. })
    }

    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => DispatchStatus::Success,
            Err(err) if err.is_transient() => DispatchStatus::Retry {
                error: err.to_string(),
            },
            Err(err) => DispatchStatus::DeadLetter {
                error: err.to_string(),
            },
        }
    }
}

#[derive(Clone)]
pub struct ScanWorker {
    engine: ScanEngine,
    index: IndexScanProcessor,
    pages: PageScanProcessor,
    leaves: LeafScanProcessor,
}

impl fmt::Debug for ScanWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanWorker")
            .field("queue", &self.engine.queue)
            .field("batch_size", &self.engine.config.queue.batch_size)
            .finish()
    }
}

impl ScanWorker {
    pub fn new(engine: ScanEngine) -> Self {
        let cursors = CursorService::new(engine.clone());
        Self::with_cursors(engine, cursors)
    }

    pub fn with_cursors(engine: ScanEngine, cursors: CursorService) -> Self {
        Self {
            index: IndexScanProcessor::new(engine.clone(), cursors),
            pages: PageScanProcessor::new(engine.clone()),
            leaves: LeafScanProcessor::new(engine.clone()),
            engine,
        }
    }

    /// Receives and handles one batch. Returns how many deliveries it saw.
    pub async fn run_once(&self) -> Result<usize> {
        let config = &self.engine.config.queue;
        let deliveries = self
            .engine
            .queue
            .receive(config.batch_size, config.visibility_timeout())
            .await?;
        let count = deliveries.len();
        if count > 0 {
            self.handle_batch(deliveries).await;
        }
        Ok(count)
    }

    /// Dispatches index and page deliveries one at a time and leaf
    /// deliveries as a single batch, then settles every delivery.
    pub async fn handle_batch(&self, deliveries: Vec<Delivery>) {
        let mut leaf_receipts = Vec::new();
        let mut leaf_deliveries = Vec::new();

        for delivery in deliveries {
            match delivery.message {
                ScanMessage::Leaf(message) => {
                    leaf_receipts.push(delivery.receipt);
                    leaf_deliveries.push(LeafDelivery {
                        message,
                        dequeue_count: delivery.dequeue_count,
                    });
                }
                message => {
                    self.handle_single(delivery.receipt, message, delivery.dequeue_count)
                        .await;
                }
            }
        }

        if !leaf_deliveries.is_empty() {
            self.handle_leaves(&leaf_receipts, &leaf_deliveries).await;
        }
    }

    async fn handle_single(&self, receipt: ReceiptId, message: ScanMessage, dequeue_count: u32) {
        let max_dequeue = self.engine.config.queue.max_dequeue_count;
        let status = if dequeue_count > max_dequeue {
            DispatchStatus::DeadLetter {
                error: format!("delivered {dequeue_count} times"),
            }
        } else {
            let result = match &message {
                ScanMessage::Index(m) => self.index.process(m).await,
                ScanMessage::Page(m) => self.pages.process(m).await,
                ScanMessage::Leaf(_) => Err(ScanError::invariant(
                    "leaf messages are handled in batches",
                )),
            };
            DispatchStatus::from_result(result)
        };

        match status {
            DispatchStatus::Success => self.complete(receipt).await,
            DispatchStatus::Retry { error } => {
                let delay = self.engine.config.poll.delay(dequeue_count);
                warn!(
                    target: "catscan::worker",
                    kind = message.kind(),
                    scan_id = %message.scan_id(),
                    dequeue_count,
                    "message failed; will retry: {error}"
                );
                self.abandon(receipt, delay).await;
            }
            DispatchStatus::DeadLetter { error } => {
                error!(
                    target: "catscan::worker",
                    kind = message.kind(),
                    scan_id = %message.scan_id(),
                    dequeue_count,
                    "moving message to the poison queue: {error}"
                );
                self.dead_letter(receipt, message).await;
            }
        }
    }

    async fn handle_leaves(&self, receipts: &[ReceiptId], deliveries: &[LeafDelivery]) {
        let dispositions = self.leaves.process_batch(deliveries).await;
        for (receipt, disposition) in receipts.iter().zip(dispositions) {
            match disposition {
                LeafDisposition::Failed { retry_after, error } => {
                    debug!(target: "catscan::worker", %receipt, "leaf failed: {error}");
                    self.abandon(*receipt, retry_after).await;
                }
                settled => {
                    debug_assert!(settled.settles_delivery());
                    self.complete(*receipt).await;
                }
            }
        }
    }

    async fn complete(&self, receipt: ReceiptId) {
        if let Err(err) = self.engine.queue.complete(receipt).await {
            error!(target: "catscan::worker", %receipt, "queue complete error: {err}");
        }
    }

    async fn abandon(&self, receipt: ReceiptId, delay: Duration) {
        if let Err(err) = self.engine.queue.abandon(receipt, delay).await {
            error!(target: "catscan::worker", %receipt, "queue abandon error: {err}");
        }
    }

    async fn dead_letter(&self, receipt: ReceiptId, message: ScanMessage) {
        match self.engine.queue.enqueue_poison(vec![message]).await {
            Ok(()) => self.complete(receipt).await,
            Err(err) => {
                error!(target: "catscan::worker", %receipt, "queue dead-letter error: {err}");
            }
        }
    }
}

/// Spawns `worker_count` receive loops that run until `shutdown` fires.
pub fn spawn_worker_pool(
    worker: Arc<ScanWorker>,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let config = worker.engine.config.queue;
    (0..config.worker_count.max(1))
        .map(|i| {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            let worker_id = format!("catscan-{}-w{i}", std::process::id());
            tokio::spawn(async move {
                info!(target: "catscan::worker", worker = %worker_id, "worker started");
                loop {
                    if shutdown.is_cancelled() {
                        info!(
                            target: "catscan::worker",
                            worker = %worker_id,
                            "worker shutting down"
                        );
                        break;
                    }

                    let idle = match worker.run_once().await {
                        Ok(0) => true,
                        Ok(_) => false,
                        Err(err) => {
                            error!(
                                target: "catscan::worker",
                                worker = %worker_id,
                                "receive failed: {err}"
                            );
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(config.idle_poll()) => {}
                        }
                    }
                }
            })
        })
        .collect()
}
