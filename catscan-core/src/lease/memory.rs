use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LeaseService, LeaseToken};
use crate::clock::Clock;
use crate::error::Result;

#[derive(Clone)]
pub struct InMemoryLeaseService {
    clock: Arc<dyn Clock>,
    leases: Arc<Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>>,
}

impl fmt::Debug for InMemoryLeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let held = self
            .leases
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryLeaseService")
            .field("held", &held)
            .finish()
    }
}

impl InMemoryLeaseService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn try_acquire(
        &self,
        name: &str,
        ttl: chrono::Duration,
    ) -> Result<Option<LeaseToken>> {
        let now = self.clock.now();
        let mut guard = self.leases.lock().await;
        if let Some((_, expires_at)) = guard.get(name)
            && *expires_at > now
        {
            return Ok(None);
        }

        let owner = Uuid::new_v4();
        let expires_at = now + ttl;
        guard.insert(name.to_string(), (owner, expires_at));
        Ok(Some(LeaseToken {
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
        let now = self.clock.now();
        let mut guard = self.leases.lock().await;
        match guard.get_mut(&token.name) {
            Some((owner, expires_at)) if *owner == token.owner => {
                *expires_at = now + ttl;
                Ok(Some(LeaseToken {
                    expires_at: *expires_at,
                    ..token.clone()
                }))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        let mut guard = self.leases.lock().await;
        if guard
            .get(&token.name)
            .is_some_and(|(owner, _)| *owner == token.owner)
        {
            guard.remove(&token.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LeaseConfig;
    use crate::lease::HeldLease;

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let clock = ManualClock::new(Utc::now());
        let leases = InMemoryLeaseService::new(Arc::new(clock.clone()));
        let ttl = chrono::Duration::seconds(30);

        let first = leases.try_acquire("Start-x", ttl).await.unwrap();
        assert!(first.is_some());
        assert!(leases.try_acquire("Start-x", ttl).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(31));
        let second = leases.try_acquire("Start-x", ttl).await.unwrap();
        assert!(second.is_some());

        // The expired owner can no longer renew.
        let stale = leases.renew(&first.unwrap(), ttl).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn held_lease_release_frees_the_name() {
        let clock = ManualClock::new(Utc::now());
        let service: Arc<dyn LeaseService> =
            Arc::new(InMemoryLeaseService::new(Arc::new(clock)));
        let config = LeaseConfig::default();

        let held = HeldLease::acquire(Arc::clone(&service), "Start-y", &config)
            .await
            .unwrap()
            .expect("lease should be free");
        assert!(
            HeldLease::acquire(Arc::clone(&service), "Start-y", &config)
                .await
                .unwrap()
                .is_none()
        );

        held.release().await.unwrap();
        assert!(
            HeldLease::acquire(service, "Start-y", &config)
                .await
                .unwrap()
                .is_some()
        );
    }
}
