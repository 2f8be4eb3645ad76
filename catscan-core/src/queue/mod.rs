//! At-least-once work queue with delayed visibility and a poison sub-queue.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use catscan_model::ScanMessage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::{EnqueueRecord, InMemoryWorkQueue};
#[cfg(feature = "database")]
pub use postgres::PostgresWorkQueue;

/// Handle for one delivery of a message. Only the latest delivery's receipt
/// can complete or abandon it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ReceiptId(pub Uuid);

impl ReceiptId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ReceiptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub receipt: ReceiptId,
    pub message: ScanMessage,
    /// How many times this copy of the message has been received, this
    /// delivery included.
    pub dequeue_count: u32,
}

/// Point-in-time counters for a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub poison: usize,
}

impl QueueDepth {
    /// Messages that still need a worker.
    pub fn pending(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

/// Abstracts the queue backend consumed by the scan workers.
#[async_trait]
pub trait WorkQueue: Send + Sync + fmt::Debug {
    /// Makes `messages` visible after `delay`.
    async fn enqueue(&self, messages: Vec<ScanMessage>, delay: Duration) -> Result<()>;

    async fn enqueue_poison(&self, messages: Vec<ScanMessage>) -> Result<()>;

    /// Receives up to `max` visible messages and hides them for
    /// `visibility_timeout` unless completed or abandoned first.
    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>>;

    async fn complete(&self, receipt: ReceiptId) -> Result<()>;

    /// Returns a delivery to the queue, visible again after `delay`.
    async fn abandon(&self, receipt: ReceiptId, delay: Duration) -> Result<()>;

    async fn depth(&self) -> Result<QueueDepth>;
}
