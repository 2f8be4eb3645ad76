//! Pluggable per-driver strategies invoked at the index, page and leaf
//! granularities, plus an optional aggregate phase.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use catscan_model::{DriverType, IndexScan, IndexScanMode, LeafScan, PageScan};
use futures::FutureExt;

use crate::cursor::DependencySource;
use crate::error::{Result, ScanError};

pub mod find_latest;

pub use find_latest::FindLatestLeavesDriver;

/// What a driver wants done with one page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageScanResult {
    /// The driver handled the page; no leaf records are created.
    Processed,
    /// One leaf record per catalog leaf in bounds.
    ExpandAllowDuplicates,
    /// One leaf record per package identity; the later catalog entry wins.
    ExpandRemoveDuplicates,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafOutcome {
    Success,
    /// Transient condition outside the driver's control. Does not consume
    /// an attempt.
    TryAgainLater,
}

/// Per-item result of a batch leaf invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchItemOutcome {
    Success,
    TryAgainLater,
    Failed(String),
}

impl From<LeafOutcome> for BatchItemOutcome {
    fn from(value: LeafOutcome) -> Self {
        match value {
            LeafOutcome::Success => BatchItemOutcome::Success,
            LeafOutcome::TryAgainLater => BatchItemOutcome::TryAgainLater,
        }
    }
}

/// Index- and page-level behaviour of a driver. The aggregate hooks default
/// to no-ops.
#[async_trait]
pub trait CatalogScanDriver: Send + Sync {
    async fn process_index(&self, scan: &IndexScan) -> anyhow::Result<IndexScanMode>;

    async fn process_page(&self, page: &PageScan) -> anyhow::Result<PageScanResult>;

    async fn start_aggregate(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_aggregate_complete(&self, _scan: &IndexScan) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn finalize(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait LeafDriver: Send + Sync {
    async fn process_leaf(&self, leaf: &LeafScan) -> anyhow::Result<LeafOutcome>;
}

/// Leaf handler that sees a whole batch from one page at once. Must return
/// exactly one outcome per input, in input order. An `Err` fails every item.
#[async_trait]
pub trait BatchLeafDriver: Send + Sync {
    async fn process_leaves(
        &self,
        leaves: &[LeafScan],
    ) -> anyhow::Result<Vec<BatchItemOutcome>>;
}

/// Runs a single-leaf driver over a batch. Errors and panics are confined to
/// the leaf that caused them.
pub struct SingleLeafAdapter {
    inner: Arc<dyn LeafDriver>,
}

impl fmt::Debug for SingleLeafAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleLeafAdapter").finish_non_exhaustive()
    }
}

impl SingleLeafAdapter {
    pub fn new(inner: Arc<dyn LeafDriver>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BatchLeafDriver for SingleLeafAdapter {
    async fn process_leaves(
        &self,
        leaves: &[LeafScan],
    ) -> anyhow::Result<Vec<BatchItemOutcome>> {
        let mut outcomes = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let result = AssertUnwindSafe(self.inner.process_leaf(leaf))
                .catch_unwind()
                .await;
            let outcome = match result {
                Ok(Ok(outcome)) => outcome.into(),
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: "catscan::leaf",
                        leaf_id = %leaf.leaf_id,
                        url = %leaf.url,
                        "leaf driver failed: {err:#}"
                    );
                    BatchItemOutcome::Failed(format!("{err:#}"))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        target: "catscan::leaf",
                        leaf_id = %leaf.leaf_id,
                        url = %leaf.url,
                        "leaf driver panicked: {message}"
                    );
                    BatchItemOutcome::Failed(format!("panicked: {message}"))
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A driver as the engine sees it: its scan strategy, its optional leaf
/// handler and the sources bounding its cursor.
#[derive(Clone)]
pub struct RegisteredDriver {
    pub scan: Arc<dyn CatalogScanDriver>,
    pub leaves: Option<Arc<dyn BatchLeafDriver>>,
    pub dependencies: Vec<DependencySource>,
}

impl fmt::Debug for RegisteredDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredDriver")
            .field("has_leaf_handler", &self.leaves.is_some())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl RegisteredDriver {
    /// A driver with no leaf handler, bounded by the catalog itself.
    pub fn new(scan: Arc<dyn CatalogScanDriver>) -> Self {
        Self {
            scan,
            leaves: None,
            dependencies: vec![DependencySource::catalog()],
        }
    }

    /// A driver that implements both the scan and single-leaf contracts.
    pub fn with_leaf_driver<D>(driver: Arc<D>) -> Self
    where
        D: CatalogScanDriver + LeafDriver + 'static,
    {
        let leaf: Arc<dyn LeafDriver> = driver.clone();
        Self {
            leaves: Some(Arc::new(SingleLeafAdapter::new(leaf))),
            ..Self::new(driver)
        }
    }

    /// A driver that implements both the scan and batch-leaf contracts.
    pub fn with_batch_driver<D>(driver: Arc<D>) -> Self
    where
        D: CatalogScanDriver + BatchLeafDriver + 'static,
    {
        let batch: Arc<dyn BatchLeafDriver> = driver.clone();
        Self {
            leaves: Some(batch),
            ..Self::new(driver)
        }
    }

    /// Replaces the dependency list.
    pub fn depends_on(mut self, dependencies: Vec<DependencySource>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Lookup table from driver type to driver, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<DriverType, RegisteredDriver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver_type: impl Into<DriverType>, driver: RegisteredDriver) {
        let driver_type = driver_type.into();
        if self.drivers.insert(driver_type.clone(), driver).is_some() {
            tracing::warn!(driver = %driver_type, "driver registered twice; keeping the last");
        }
    }

    pub fn contains(&self, driver_type: &DriverType) -> bool {
        self.drivers.contains_key(driver_type)
    }

    pub fn get(&self, driver_type: &DriverType) -> Result<&RegisteredDriver> {
        self.drivers
            .get(driver_type)
            .ok_or_else(|| ScanError::UnknownDriver(driver_type.clone()))
    }

    pub fn scan_driver(&self, driver_type: &DriverType) -> Result<Arc<dyn CatalogScanDriver>> {
        Ok(Arc::clone(&self.get(driver_type)?.scan))
    }

    pub fn leaf_driver(&self, driver_type: &DriverType) -> Result<Arc<dyn BatchLeafDriver>> {
        self.get(driver_type)?.leaves.clone().ok_or_else(|| {
            ScanError::invariant(format!("driver {driver_type} has no leaf handler"))
        })
    }

    /// Drivers that own a cursor, in sorted order. The internal
    /// find-latest pre-pass is only ever started on behalf of a parent.
    pub fn startable(&self) -> Vec<DriverType> {
        let internal = DriverType::find_latest_leaves();
        let mut types: Vec<DriverType> = self
            .drivers
            .keys()
            .filter(|driver_type| **driver_type != internal)
            .cloned()
            .collect();
        types.sort();
        types
    }
}
