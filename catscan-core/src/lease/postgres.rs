use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{LeaseService, LeaseToken};
use crate::error::Result;

#[derive(Clone)]
pub struct PostgresLeaseService {
    pool: PgPool,
}

impl fmt::Debug for PostgresLeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresLeaseService")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn ttl_millis(ttl: chrono::Duration) -> i64 {
    ttl.num_milliseconds().max(1)
}

impl PostgresLeaseService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseService for PostgresLeaseService {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>> {
        let owner = Uuid::new_v4();
        let expires_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            INSERT INTO catscan_leases (name, owner, expires_at)
            VALUES ($1, $2, NOW() + ($3::BIGINT * INTERVAL '1 millisecond'))
            ON CONFLICT (name) DO UPDATE
                SET owner = EXCLUDED.owner,
                    expires_at = EXCLUDED.expires_at
                WHERE catscan_leases.expires_at < NOW()
            RETURNING expires_at
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(ttl_millis(ttl))
        .fetch_optional(&self.pool)
        .await?;

        Ok(expires_at.map(|expires_at| LeaseToken {
            name: name.to_string(),
            owner,
            expires_at,
        }))
    }

    async fn renew(
        &self,
        token: &LeaseToken,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>> {
        let expires_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            UPDATE catscan_leases
            SET expires_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond')
            WHERE name = $1 AND owner = $2
            RETURNING expires_at
            "#,
        )
        .bind(&token.name)
        .bind(token.owner)
        .bind(ttl_millis(ttl))
        .fetch_optional(&self.pool)
        .await?;

        Ok(expires_at.map(|expires_at| LeaseToken {
            expires_at,
            ..token.clone()
        }))
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        sqlx::query("DELETE FROM catscan_leases WHERE name = $1 AND owner = $2")
            .bind(&token.name)
            .bind(token.owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
