#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use catscan_core::clock::{Clock, ManualClock};
use catscan_core::lease::InMemoryLeaseService;
use catscan_core::queue::InMemoryWorkQueue;
use catscan_core::storage::InMemoryEntityStore;
use catscan_core::{
    CatalogScanDriver, CursorService, DriverRegistry, EngineComponents, EngineConfig,
    InMemoryCatalog, LeafDriver, LeafOutcome, PageScanResult, ScanEngine, ScanWorker,
    StartOutcome,
};
use catscan_model::{
    CatalogIndex, CatalogLeafItem, CatalogPage, CatalogPageItem, DriverType, IndexScan,
    IndexScanMode, LeafScan, LeafType, PageScan, ScanMessage,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

const MAX_ROUNDS: usize = 10_000;

/// Minutes past the fixture's base instant.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn page_url(number: usize) -> String {
    format!("https://catalog.test/v3/catalog0/page{number}.json")
}

pub fn leaf(id: &str, version: &str, commit: DateTime<Utc>) -> CatalogLeafItem {
    CatalogLeafItem {
        url: format!(
            "https://catalog.test/v3/catalog0/data/{}/{}.{}.json",
            commit.timestamp(),
            id.to_lowercase(),
            version.to_lowercase()
        ),
        leaf_type: LeafType::PackageDetails,
        commit_id: format!("commit-{}", commit.timestamp()),
        commit_timestamp: commit,
        package_id: id.to_string(),
        package_version: version.to_string(),
    }
}

/// Serves `pages` in order. Each page's commit is its newest leaf's commit
/// and the index commit is the newest page's.
pub async fn publish(catalog: &InMemoryCatalog, pages: Vec<Vec<CatalogLeafItem>>) {
    let mut items = Vec::new();
    for (number, leaves) in pages.into_iter().enumerate() {
        let commit = leaves
            .iter()
            .map(|leaf| leaf.commit_timestamp)
            .max()
            .unwrap_or_else(|| at(0));
        let url = page_url(number);
        items.push(CatalogPageItem {
            url: url.clone(),
            commit_timestamp: commit,
            commit_id: None,
            count: Some(leaves.len() as u32),
        });
        catalog
            .set_page(
                url,
                CatalogPage {
                    commit_timestamp: commit,
                    items: leaves,
                },
            )
            .await;
    }
    let commit = items
        .iter()
        .map(|item| item.commit_timestamp)
        .max()
        .unwrap_or_else(|| at(0));
    catalog
        .set_index(CatalogIndex {
            commit_timestamp: commit,
            count: Some(items.len() as u32),
            items,
        })
        .await;
}

/// Deterministic settings: no jitter and short delays.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.max_attempts = 5;
    config.retry.backoff_base_ms = 1_000;
    config.retry.backoff_max_ms = 8_000;
    config.retry.jitter_ratio = 0.0;
    config.retry.try_again_later_ms = 5_000;
    config.queue.batch_size = 16;
    config
}

/// One engine over in-memory backends and a manual clock.
pub struct Harness {
    pub engine: ScanEngine,
    pub cursors: CursorService,
    pub worker: ScanWorker,
    pub queue: Arc<InMemoryWorkQueue>,
    pub store: Arc<InMemoryEntityStore>,
    pub catalog: InMemoryCatalog,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self::with_config(drivers, test_config())
    }

    pub fn with_config(drivers: DriverRegistry, config: EngineConfig) -> Self {
        let clock = ManualClock::new(at(24 * 60));
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryWorkQueue::new(Arc::clone(&shared)));
        let store = Arc::new(InMemoryEntityStore::new());
        let catalog = InMemoryCatalog::new();

        let components = EngineComponents {
            store: store.clone(),
            queue: queue.clone(),
            leases: Arc::new(InMemoryLeaseService::new(Arc::clone(&shared))),
            catalog: Arc::new(catalog.clone()),
            clock: shared,
        };
        let engine = ScanEngine::new(components, drivers, config);
        let cursors = CursorService::new(engine.clone());
        let worker = ScanWorker::with_cursors(engine.clone(), cursors.clone());

        Self {
            engine,
            cursors,
            worker,
            queue,
            store,
            catalog,
            clock,
        }
    }

    pub async fn start(&self, driver: &str, max: Option<DateTime<Utc>>) -> StartOutcome {
        self.cursors
            .start(&DriverType::from(driver), None, max)
            .await
            .expect("start")
    }

    pub async fn start_new(&self, driver: &str, max: Option<DateTime<Utc>>) -> IndexScan {
        match self.start(driver, max).await {
            StartOutcome::NewStarted { scan } => *scan,
            other => panic!("expected a new scan, got {}", other.label()),
        }
    }

    pub async fn round(&self) -> usize {
        self.worker.run_once().await.expect("worker round")
    }

    /// Runs the worker until the queue is empty, jumping the clock forward
    /// whenever only delayed messages remain.
    pub async fn run_until_idle(&self) {
        for _ in 0..MAX_ROUNDS {
            if self.round().await > 0 {
                continue;
            }
            match self.queue.next_visible_at().await {
                Some(next) => {
                    if next > self.clock.now() {
                        self.clock.set(next);
                    }
                }
                None => return,
            }
        }
        panic!("queue did not drain within {MAX_ROUNDS} rounds");
    }

    /// Like [`Harness::run_until_idle`] but stops once the next message is
    /// not visible before `deadline`.
    pub async fn run_until(&self, deadline: DateTime<Utc>) {
        for _ in 0..MAX_ROUNDS {
            if self.round().await > 0 {
                continue;
            }
            match self.queue.next_visible_at().await {
                Some(next) if next <= deadline => {
                    if next > self.clock.now() {
                        self.clock.set(next);
                    }
                }
                _ => return,
            }
        }
        panic!("worker still busy after {MAX_ROUNDS} rounds");
    }

    pub async fn scan(&self, scan: &IndexScan) -> Option<IndexScan> {
        self.engine
            .storage
            .get_index_scan(&scan.cursor_name, &scan.scan_id)
            .await
            .expect("read index scan")
    }

    pub async fn cursor_value(&self, driver: &str) -> DateTime<Utc> {
        self.cursors
            .get_cursor(&DriverType::from(driver))
            .await
            .expect("read cursor")
            .value
    }

    pub async fn enqueued_leaves(&self) -> usize {
        self.queue
            .history()
            .await
            .iter()
            .filter(|record| matches!(record.message, ScanMessage::Leaf(_)))
            .count()
    }

    pub async fn enqueued_pages(&self) -> usize {
        self.queue
            .history()
            .await
            .iter()
            .filter(|record| matches!(record.message, ScanMessage::Page(_)))
            .count()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafStep {
    Succeed,
    TryAgainLater,
    Fail,
}

/// Driver whose leaf results follow a per-package script. Unscripted
/// packages succeed.
#[derive(Debug)]
pub struct ScriptedDriver {
    mode: IndexScanMode,
    page_result: PageScanResult,
    scripts: Mutex<HashMap<String, VecDeque<LeafStep>>>,
    processed: Mutex<Vec<LeafScan>>,
    calls: Mutex<HashMap<String, usize>>,
    finalized: AtomicUsize,
}

impl ScriptedDriver {
    pub fn expanding(page_result: PageScanResult) -> Self {
        Self::with_mode(IndexScanMode::Expand, page_result)
    }

    pub fn latest_leaves() -> Self {
        Self::with_mode(
            IndexScanMode::ExpandLatestLeaves,
            PageScanResult::ExpandAllowDuplicates,
        )
    }

    fn with_mode(mode: IndexScanMode, page_result: PageScanResult) -> Self {
        Self {
            mode,
            page_result,
            scripts: Mutex::new(HashMap::new()),
            processed: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            finalized: AtomicUsize::new(0),
        }
    }

    pub fn script(self, package_id: &str, steps: Vec<LeafStep>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(package_id.to_lowercase(), steps.into());
        self
    }

    pub fn processed(&self) -> Vec<LeafScan> {
        self.processed.lock().unwrap().clone()
    }

    pub fn calls(&self, package_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&package_id.to_lowercase())
            .copied()
            .unwrap_or_default()
    }

    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogScanDriver for ScriptedDriver {
    async fn process_index(&self, _scan: &IndexScan) -> anyhow::Result<IndexScanMode> {
        Ok(self.mode)
    }

    async fn process_page(&self, _page: &PageScan) -> anyhow::Result<PageScanResult> {
        Ok(self.page_result)
    }

    async fn finalize(&self, _scan: &IndexScan) -> anyhow::Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl LeafDriver for ScriptedDriver {
    async fn process_leaf(&self, leaf: &LeafScan) -> anyhow::Result<LeafOutcome> {
        let key = leaf.package_id.to_lowercase();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(LeafStep::Succeed);
        match step {
            LeafStep::Succeed => {
                self.processed.lock().unwrap().push(leaf.clone());
                Ok(LeafOutcome::Success)
            }
            LeafStep::TryAgainLater => Ok(LeafOutcome::TryAgainLater),
            LeafStep::Fail => anyhow::bail!("scripted failure for {}", leaf.package_id),
        }
    }
}

pub fn registry_with(name: &str, driver: Arc<ScriptedDriver>) -> DriverRegistry {
    let mut drivers = DriverRegistry::new();
    drivers.register(name, catscan_core::RegisteredDriver::with_leaf_driver(driver));
    drivers
}
