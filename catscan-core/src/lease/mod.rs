//! Named, time-boxed mutual exclusion. Used to serialize scan starts.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LeaseConfig;
use crate::error::Result;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryLeaseService;
#[cfg(feature = "database")]
pub use postgres::PostgresLeaseService;

/// Lease metadata returned when a lease is acquired or renewed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub name: String,
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait LeaseService: Send + Sync + fmt::Debug {
    /// Returns `None` while another owner holds an unexpired lease.
    async fn try_acquire(
        &self,
        name: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>>;

    /// Extends a held lease. `None` means the lease was lost.
    async fn renew(
        &self,
        token: &LeaseToken,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>>;

    async fn release(&self, token: &LeaseToken) -> Result<()>;
}

/// A lease kept alive by a background renewal task until released or
/// dropped. Dropping stops renewal and lets the TTL expire.
pub struct HeldLease {
    token: LeaseToken,
    service: Arc<dyn LeaseService>,
    shutdown: CancellationToken,
    renewer: Option<JoinHandle<()>>,
}

impl fmt::Debug for HeldLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLease")
            .field("token", &self.token)
            .field("renewing", &!self.shutdown.is_cancelled())
            .finish()
    }
}

impl HeldLease {
    pub async fn acquire(
        service: Arc<dyn LeaseService>,
        name: &str,
        config: &LeaseConfig,
    ) -> Result<Option<Self>> {
        let ttl = config.ttl();
        let Some(token) = service.try_acquire(name, ttl).await? else {
            return Ok(None);
        };

        let shutdown = CancellationToken::new();
        let renewer = tokio::spawn(renew_loop(
            Arc::clone(&service),
            token.clone(),
            ttl,
            config.renew_interval(),
            shutdown.clone(),
        ));

        Ok(Some(Self {
            token,
            service,
            shutdown,
            renewer: Some(renewer),
        }))
    }

    pub fn name(&self) -> &str {
        &self.token.name
    }

    pub async fn release(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.renewer.take() {
            if let Err(err) = handle.await {
                tracing::warn!(
                    lease = %self.token.name,
                    "lease renewal task ended abnormally: {err}"
                );
            }
        }
        self.service.release(&self.token).await
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn renew_loop(
    service: Arc<dyn LeaseService>,
    mut token: LeaseToken,
    ttl: chrono::Duration,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                match service.renew(&token, ttl).await {
                    Ok(Some(renewed)) => token = renewed,
                    Ok(None) => {
                        tracing::warn!(lease = %token.name, "lease lost before release");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(lease = %token.name, "lease renewal failed: {err}");
                    }
                }
            }
        }
    }
}
