//! Postgres-backed work queue. Receives claim rows with
//! `FOR UPDATE SKIP LOCKED` and hide them by pushing `visible_at` forward.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use catscan_model::ScanMessage;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use super::{Delivery, QueueDepth, ReceiptId, WorkQueue};
use crate::error::{Result, ScanError};

#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
}

impl fmt::Debug for PostgresWorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresWorkQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl PostgresWorkQueue {
    /// Create a new queue and verify the dequeue index exists.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let idx_exists = sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_catscan_messages_ready")
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !idx_exists {
            return Err(ScanError::Queue(
                "Required index idx_catscan_messages_ready is missing; run migrations".into(),
            ));
        }
        info!("Work queue connected to Postgres");

        Ok(Self { pool })
    }

    async fn insert(
        &self,
        messages: Vec<ScanMessage>,
        delay: Duration,
        poison: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            let payload = serde_json::to_value(&message)?;
            sqlx::query(
                r#"
                INSERT INTO catscan_messages (id, payload, poison, visible_at)
                VALUES ($1, $2, $3, NOW() + ($4::BIGINT * INTERVAL '1 millisecond'))
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(payload)
            .bind(poison)
            .bind(millis(delay))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn enqueue(&self, messages: Vec<ScanMessage>, delay: Duration) -> Result<()> {
        self.insert(messages, delay, false).await
    }

    async fn enqueue_poison(&self, messages: Vec<ScanMessage>) -> Result<()> {
        self.insert(messages, Duration::ZERO, true).await
    }

    async fn receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, serde_json::Value, i32)>(
            r#"
            WITH picked AS (
                SELECT id
                FROM catscan_messages
                WHERE poison = FALSE
                  AND visible_at <= NOW()
                ORDER BY visible_at, enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE catscan_messages m
            SET dequeue_count = m.dequeue_count + 1,
                receipt = gen_random_uuid(),
                visible_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond')
            FROM picked
            WHERE m.id = picked.id
            RETURNING m.id, m.receipt, m.payload, m.dequeue_count
            "#,
        )
        .bind(max as i64)
        .bind(millis(visibility_timeout))
        .fetch_all(&self.pool)
        .await?;

        let mut deliveries = Vec::with_capacity(rows.len());
        for (id, receipt, payload, dequeue_count) in rows {
            match serde_json::from_value::<ScanMessage>(payload) {
                Ok(message) => deliveries.push(Delivery {
                    receipt: ReceiptId(receipt),
                    message,
                    dequeue_count: dequeue_count.max(0) as u32,
                }),
                Err(err) => {
                    error!(message_id = %id, "undecodable message moved to poison: {err}");
                    sqlx::query(
                        "UPDATE catscan_messages SET poison = TRUE, receipt = NULL WHERE id = $1",
                    )
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn complete(&self, receipt: ReceiptId) -> Result<()> {
        sqlx::query("DELETE FROM catscan_messages WHERE receipt = $1")
            .bind(receipt.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn abandon(&self, receipt: ReceiptId, delay: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE catscan_messages
            SET receipt = NULL,
                visible_at = NOW() + ($2::BIGINT * INTERVAL '1 millisecond')
            WHERE receipt = $1
            "#,
        )
        .bind(receipt.0)
        .bind(millis(delay))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let (ready, delayed, in_flight, poison) =
            sqlx::query_as::<_, (i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE NOT poison AND visible_at <= NOW()),
                    COUNT(*) FILTER (WHERE NOT poison AND visible_at > NOW() AND receipt IS NULL),
                    COUNT(*) FILTER (
                        WHERE NOT poison AND visible_at > NOW() AND receipt IS NOT NULL
                    ),
                    COUNT(*) FILTER (WHERE poison)
                FROM catscan_messages
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueDepth {
            ready: ready as usize,
            delayed: delayed as usize,
            in_flight: in_flight as usize,
            poison: poison as usize,
        })
    }
}
