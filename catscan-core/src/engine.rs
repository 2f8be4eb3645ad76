//! Shared handles every processor and service works through.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use catscan_model::{DriverType, ScanMessage};
use chrono::{DateTime, Utc};

use crate::catalog::CatalogSource;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::driver::{DriverRegistry, FindLatestLeavesDriver, RegisteredDriver};
use crate::error::Result;
use crate::lease::{InMemoryLeaseService, LeaseService};
use crate::queue::{InMemoryWorkQueue, WorkQueue};
use crate::storage::{CatalogScanStorage, EntityStore, InMemoryEntityStore};

/// Backends the engine runs against.
#[derive(Clone)]
pub struct EngineComponents {
    pub store: Arc<dyn EntityStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub leases: Arc<dyn LeaseService>,
    pub catalog: Arc<dyn CatalogSource>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for EngineComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineComponents")
            .field("store", &self.store)
            .field("queue", &self.queue)
            .field("leases", &self.leases)
            .field("catalog", &self.catalog)
            .finish()
    }
}

impl EngineComponents {
    /// Single-process backends around the given catalog.
    pub fn in_memory(catalog: Arc<dyn CatalogSource>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store: Arc::new(InMemoryEntityStore::new()),
            queue: Arc::new(InMemoryWorkQueue::new(Arc::clone(&clock))),
            leases: Arc::new(InMemoryLeaseService::new(Arc::clone(&clock))),
            catalog,
            clock,
        }
    }
}

#[derive(Clone)]
pub struct ScanEngine {
    pub storage: CatalogScanStorage,
    pub queue: Arc<dyn WorkQueue>,
    pub leases: Arc<dyn LeaseService>,
    pub catalog: Arc<dyn CatalogSource>,
    pub clock: Arc<dyn Clock>,
    pub drivers: Arc<DriverRegistry>,
    pub config: Arc<EngineConfig>,
}

impl fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanEngine")
            .field("drivers", &self.drivers.startable())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl ScanEngine {
    /// Wires the engine and registers the internal find-latest driver.
    pub fn new(
        components: EngineComponents,
        mut drivers: DriverRegistry,
        config: EngineConfig,
    ) -> Self {
        let storage = CatalogScanStorage::new(components.store);
        let find_latest =
            FindLatestLeavesDriver::new(storage.clone(), Arc::clone(&components.catalog));
        drivers.register(
            DriverType::find_latest_leaves(),
            RegisteredDriver::new(Arc::new(find_latest)),
        );

        Self {
            storage,
            queue: components.queue,
            leases: components.leases,
            catalog: components.catalog,
            clock: components.clock,
            drivers: Arc::new(drivers),
            config: Arc::new(config),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn enqueue<M>(&self, messages: Vec<M>, delay: Duration) -> Result<()>
    where
        M: Into<ScanMessage>,
    {
        if messages.is_empty() {
            return Ok(());
        }
        let messages: Vec<ScanMessage> = messages.into_iter().map(Into::into).collect();
        self.queue.enqueue(messages, delay).await
    }
}
