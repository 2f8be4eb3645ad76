use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catscan_model::ScanMessage;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Delivery, QueueDepth, ReceiptId, WorkQueue};
use crate::clock::Clock;
use crate::error::Result;

#[derive(Clone, Debug)]
struct Entry {
    seq: u64,
    message: ScanMessage,
    visible_at: DateTime<Utc>,
    dequeue_count: u32,
    receipt: Option<ReceiptId>,
}

/// Every enqueue the queue has accepted, in order.
#[derive(Clone, Debug, PartialEq)]
pub struct EnqueueRecord {
    pub message: ScanMessage,
    pub delay: Duration,
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<Entry>,
    poison: Vec<ScanMessage>,
    history: Vec<EnqueueRecord>,
    next_seq: u64,
}

/// Process-local queue whose visibility timing follows an injected clock.
#[derive(Clone)]
pub struct InMemoryWorkQueue {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for InMemoryWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .state
            .try_lock()
            .map(|guard| guard.entries.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryWorkQueue")
            .field("clock", &self.clock)
            .field("entries", &entries)
            .finish()
    }
}

fn offset(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

impl InMemoryWorkQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Earliest time any message becomes visible, if the queue holds any.
    pub async fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        let guard = self.state.lock().await;
        guard.entries.iter().map(|entry| entry.visible_at).min()
    }

    pub async fn poison_messages(&self) -> Vec<ScanMessage> {
        self.state.lock().await.poison.clone()
    }

    pub async fn history(&self) -> Vec<EnqueueRecord> {
        self.state.lock().await.history.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, messages: Vec<ScanMessage>, delay: Duration) -> Result<()> {
        let visible_at = self.clock.now() + offset(delay);
        let mut guard = self.state.lock().await;
        for message in messages {
            guard.next_seq += 1;
            let seq = guard.next_seq;
            guard.history.push(EnqueueRecord {
                message: message.clone(),
                delay,
            });
            guard.entries.push(Entry {
                seq,
                message,
                visible_at,
                dequeue_count: 0,
                receipt: None,
            });
        }
        Ok(())
    }

    async fn enqueue_poison(&self, messages: Vec<ScanMessage>) -> Result<()> {
        let mut guard = self.state.lock().await;
        guard.poison.extend(messages);
        Ok(())
    }

    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>> {
        let now = self.clock.now();
        let hidden_until = now + offset(visibility_timeout);
        let mut guard = self.state.lock().await;

        let mut visible: Vec<&mut Entry> = guard
            .entries
            .iter_mut()
            .filter(|entry| entry.visible_at <= now)
            .collect();
        visible.sort_by_key(|entry| (entry.visible_at, entry.seq));

        let mut deliveries = Vec::new();
        for entry in visible.into_iter().take(max) {
            let receipt = ReceiptId::new();
            entry.dequeue_count += 1;
            entry.receipt = Some(receipt);
            entry.visible_at = hidden_until;
            deliveries.push(Delivery {
                receipt,
                message: entry.message.clone(),
                dequeue_count: entry.dequeue_count,
            });
        }
        Ok(deliveries)
    }

    async fn complete(&self, receipt: ReceiptId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let before = guard.entries.len();
        guard.entries.retain(|entry| entry.receipt != Some(receipt));
        if guard.entries.len() == before {
            debug!(%receipt, "complete for unknown receipt ignored");
        }
        Ok(())
    }

    async fn abandon(&self, receipt: ReceiptId, delay: Duration) -> Result<()> {
        let visible_at = self.clock.now() + offset(delay);
        let mut guard = self.state.lock().await;
        match guard
            .entries
            .iter_mut()
            .find(|entry| entry.receipt == Some(receipt))
        {
            Some(entry) => {
                entry.receipt = None;
                entry.visible_at = visible_at;
            }
            None => debug!(%receipt, "abandon for unknown receipt ignored"),
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = self.clock.now();
        let guard = self.state.lock().await;
        let mut depth = QueueDepth {
            poison: guard.poison.len(),
            ..QueueDepth::default()
        };
        for entry in &guard.entries {
            if entry.visible_at <= now {
                depth.ready += 1;
            } else if entry.receipt.is_some() {
                depth.in_flight += 1;
            } else {
                depth.delayed += 1;
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use catscan_model::IndexScanMessage;

    fn message(n: u32) -> ScanMessage {
        ScanMessage::Index(IndexScanMessage {
            cursor_name: "c".into(),
            scan_id: format!("{n:020}-x").parse().unwrap(),
            attempt_count: 0,
        })
    }

    #[tokio::test]
    async fn delayed_messages_become_visible_with_the_clock() {
        let clock = ManualClock::new(Utc::now());
        let queue = InMemoryWorkQueue::new(Arc::new(clock.clone()));

        queue
            .enqueue(vec![message(1)], Duration::from_secs(30))
            .await
            .unwrap();
        assert!(queue.receive(10, Duration::from_secs(60)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(30));
        let deliveries = queue.receive(10, Duration::from_secs(60)).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].dequeue_count, 1);
    }

    #[tokio::test]
    async fn abandoned_messages_count_redeliveries() {
        let clock = ManualClock::new(Utc::now());
        let queue = InMemoryWorkQueue::new(Arc::new(clock.clone()));
        queue.enqueue(vec![message(1)], Duration::ZERO).await.unwrap();

        let first = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        queue.abandon(first[0].receipt, Duration::ZERO).await.unwrap();
        let second = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second[0].dequeue_count, 2);

        // The stale receipt no longer controls the message.
        queue.complete(first[0].receipt).await.unwrap();
        assert!(!queue.is_empty().await);

        queue.complete(second[0].receipt).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn visibility_timeout_redelivers_unfinished_work() {
        let clock = ManualClock::new(Utc::now());
        let queue = InMemoryWorkQueue::new(Arc::new(clock.clone()));
        queue.enqueue(vec![message(1), message(2)], Duration::ZERO).await.unwrap();

        let taken = queue.receive(1, Duration::from_secs(10)).await.unwrap();
        assert_eq!(taken.len(), 1);
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.ready, 1);
        assert_eq!(depth.in_flight, 1);

        clock.advance(chrono::Duration::seconds(10));
        let again = queue.receive(10, Duration::from_secs(10)).await.unwrap();
        assert_eq!(again.len(), 2);
    }
}
