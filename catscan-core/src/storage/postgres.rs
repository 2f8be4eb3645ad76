//! Postgres-backed entity store. All tables share `catscan_entities`; the
//! logical table name is part of the primary key.

use std::fmt;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use super::{EntityRow, EntityStore, InsertOutcome, WriteOutcome};
use crate::error::{Result, ScanError};

#[derive(Clone)]
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresEntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresEntityStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

type RowTuple = (String, String, i64, serde_json::Value);

fn to_row((partition_key, row_key, version, body): RowTuple) -> EntityRow {
    EntityRow {
        partition_key,
        row_key,
        version: version as u64,
        body,
    }
}

/// Escapes `LIKE` wildcards so the prefix matches literally.
fn like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

impl PostgresEntityStore {
    /// Create the store and verify the schema is present.
    pub async fn new(pool: PgPool) -> Result<Self> {
        let table_exists = sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT 1
            FROM information_schema.tables
            WHERE table_name = 'catscan_entities'
            LIMIT 1
            "#,
        )
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !table_exists {
            return Err(ScanError::Storage(
                "table catscan_entities is missing; run migrations".into(),
            ));
        }
        info!("Entity store connected to Postgres");

        Ok(Self { pool })
    }

    async fn current_version(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<i64>> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT version FROM catscan_entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<EntityRow>> {
        let row = sqlx::query_as::<_, RowTuple>(
            r#"
            SELECT partition_key, row_key, version, body
            FROM catscan_entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_row))
    }

    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<EntityRow>> {
        let rows = sqlx::query_as::<_, RowTuple>(
            r#"
            SELECT partition_key, row_key, version, body
            FROM catscan_entities
            WHERE table_name = $1 AND partition_key = $2
            ORDER BY row_key
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    async fn query_prefix(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EntityRow>> {
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, RowTuple>(
            r#"
            SELECT partition_key, row_key, version, body
            FROM catscan_entities
            WHERE table_name = $1 AND partition_key LIKE $2 ESCAPE '\'
            ORDER BY partition_key, row_key
            LIMIT $3
            "#,
        )
        .bind(table)
        .bind(like_prefix(prefix))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(to_row).collect())
    }

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        body: serde_json::Value,
    ) -> Result<InsertOutcome> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO catscan_entities
                (table_name, partition_key, row_key, version, body)
            VALUES ($1, $2, $3, nextval('catscan_entity_version_seq'), $4)
            ON CONFLICT DO NOTHING
            RETURNING version
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match version {
            Some(version) => InsertOutcome::Inserted(version as u64),
            None => InsertOutcome::AlreadyExists,
        })
    }

    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_version: u64,
        body: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE catscan_entities
            SET body = $5,
                version = nextval('catscan_entity_version_seq'),
                updated_at = NOW()
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
              AND version = $4
            RETURNING version
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(expected_version as i64)
        .bind(body)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = version {
            return Ok(WriteOutcome::Written(version as u64));
        }
        match self.current_version(table, partition_key, row_key).await? {
            Some(_) => Ok(WriteOutcome::Conflict),
            None => Ok(WriteOutcome::Missing),
        }
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            DELETE FROM catscan_entities
            WHERE table_name = $1 AND partition_key = $2 AND row_key = $3
              AND ($4::BIGINT IS NULL OR version = $4)
            RETURNING version
            "#,
        )
        .bind(table)
        .bind(partition_key)
        .bind(row_key)
        .bind(expected_version.map(|v| v as i64))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = version {
            return Ok(WriteOutcome::Written(version as u64));
        }
        match self.current_version(table, partition_key, row_key).await? {
            Some(_) => Ok(WriteOutcome::Conflict),
            None => Ok(WriteOutcome::Missing),
        }
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM catscan_entities WHERE table_name = $1")
            .bind(table)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(table, deleted, "deleted entity table");
        Ok(())
    }
}
