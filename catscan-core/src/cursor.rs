//! Cursor and dependency service: decides whether and over which window a
//! driver may run next, and moves cursors forward when runs finish.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catscan_model::{
    CursorRecord, DriverType, IndexScan, IndexScanMode, IndexScanState, ParentScan, ScanId,
    ScanMessage, epoch,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogSource;
use crate::engine::ScanEngine;
use crate::error::{Result, ScanError};
use crate::lease::HeldLease;
use crate::storage::WriteOutcome;

const CURSOR_WRITE_ATTEMPTS: usize = 10;
const ABORT_WRITE_ATTEMPTS: usize = 5;

/// Something a driver's cursor may not run ahead of.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DependencySource {
    /// Another driver's cursor.
    Driver(DriverType),
    /// A named source registered with the cursor service.
    External(String),
}

impl DependencySource {
    pub const CATALOG: &'static str = "catalog";

    pub fn catalog() -> Self {
        DependencySource::External(Self::CATALOG.to_string())
    }
}

impl fmt::Display for DependencySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencySource::Driver(driver) => f.write_str(&driver.cursor_name()),
            DependencySource::External(name) => f.write_str(name),
        }
    }
}

/// Current value of a source outside the engine's own cursors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExternalCursor: Send + Sync {
    async fn value(&self) -> Result<DateTime<Utc>>;
}

/// The catalog's own commit timestamp.
#[derive(Clone, Debug)]
pub struct CatalogCommitCursor {
    catalog: Arc<dyn CatalogSource>,
}

impl CatalogCommitCursor {
    pub fn new(catalog: Arc<dyn CatalogSource>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ExternalCursor for CatalogCommitCursor {
    async fn value(&self) -> Result<DateTime<Utc>> {
        Ok(self.catalog.get_index().await?.commit_timestamp)
    }
}

/// Operator-pinned value from configuration.
#[derive(Clone, Copy, Debug)]
pub struct PinnedCursor(pub DateTime<Utc>);

#[async_trait]
impl ExternalCursor for PinnedCursor {
    async fn value(&self) -> Result<DateTime<Utc>> {
        Ok(self.0)
    }
}

/// Why a start request did or did not create a scan.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    NewStarted { scan: Box<IndexScan> },
    AlreadyRunning { scan: Box<IndexScan> },
    Blocked { dependency: String },
    FullyCaughtUpWithMax,
    FullyCaughtUpWithDependency { dependency: String },
    MinAfterMax,
    Disabled,
    UnavailableLease,
}

impl StartOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StartOutcome::NewStarted { .. } => "new_started",
            StartOutcome::AlreadyRunning { .. } => "already_running",
            StartOutcome::Blocked { .. } => "blocked",
            StartOutcome::FullyCaughtUpWithMax => "fully_caught_up_with_max",
            StartOutcome::FullyCaughtUpWithDependency { .. } => {
                "fully_caught_up_with_dependency"
            }
            StartOutcome::MinAfterMax => "min_after_max",
            StartOutcome::Disabled => "disabled",
            StartOutcome::UnavailableLease => "unavailable_lease",
        }
    }

    pub fn scan(&self) -> Option<&IndexScan> {
        match self {
            StartOutcome::NewStarted { scan } | StartOutcome::AlreadyRunning { scan } => {
                Some(scan)
            }
            _ => None,
        }
    }
}

/// Snapshot reported by `status`.
#[derive(Clone, Debug, Serialize)]
pub struct CursorStatus {
    pub driver_type: DriverType,
    pub cursor: CursorRecord,
    pub dependencies: Vec<DependencySource>,
    pub dependency_max: DateTime<Utc>,
    pub latest_scans: Vec<IndexScan>,
}

/// Messages re-enqueued by `requeue`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RequeueCounts {
    pub leaves: usize,
    pub pages: usize,
}

#[derive(Clone)]
pub struct CursorService {
    engine: ScanEngine,
    externals: Arc<HashMap<String, Arc<dyn ExternalCursor>>>,
}

impl fmt::Debug for CursorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<&String> = self.externals.keys().collect();
        sources.sort();
        f.debug_struct("CursorService")
            .field("external_sources", &sources)
            .finish_non_exhaustive()
    }
}

impl CursorService {
    /// Registers the catalog source plus every pinned source from config.
    pub fn new(engine: ScanEngine) -> Self {
        let mut externals: HashMap<String, Arc<dyn ExternalCursor>> = HashMap::new();
        externals.insert(
            DependencySource::CATALOG.to_string(),
            Arc::new(CatalogCommitCursor::new(Arc::clone(&engine.catalog))),
        );
        for (name, value) in &engine.config.pinned_sources {
            externals.insert(name.clone(), Arc::new(PinnedCursor(*value)));
        }
        Self {
            engine,
            externals: Arc::new(externals),
        }
    }

    /// Adds or replaces a named external source.
    pub fn with_external(
        mut self,
        name: impl Into<String>,
        source: Arc<dyn ExternalCursor>,
    ) -> Self {
        Arc::make_mut(&mut self.externals).insert(name.into(), source);
        self
    }

    pub async fn get_cursor(&self, driver_type: &DriverType) -> Result<CursorRecord> {
        self.engine.storage.get_cursor(&driver_type.cursor_name()).await
    }

    async fn source_value(&self, source: &DependencySource) -> Result<DateTime<Utc>> {
        match source {
            DependencySource::Driver(driver) => Ok(self.get_cursor(driver).await?.value),
            DependencySource::External(name) => {
                let cursor = self.externals.get(name).ok_or_else(|| {
                    ScanError::InvalidArgument(format!("unknown dependency source {name}"))
                })?;
                cursor.value().await
            }
        }
    }

    /// Lowest value across a driver's dependencies, with the name of the
    /// source that set it. A driver without dependencies reads as the epoch.
    pub async fn dependency_max(
        &self,
        driver_type: &DriverType,
    ) -> Result<(DateTime<Utc>, String)> {
        let dependencies = &self.engine.drivers.get(driver_type)?.dependencies;
        let mut lowest: Option<(DateTime<Utc>, String)> = None;
        for source in dependencies {
            let value = self.source_value(source).await?;
            if lowest.as_ref().is_none_or(|(current, _)| value < *current) {
                lowest = Some((value, source.to_string()));
            }
        }
        Ok(lowest.unwrap_or_else(|| (epoch(), "none".to_string())))
    }

    async fn disabled_or_started(
        &self,
        driver_type: &DriverType,
    ) -> Result<Option<StartOutcome>> {
        if self.engine.config.is_disabled(driver_type) {
            return Ok(Some(StartOutcome::Disabled));
        }
        let incomplete = self
            .engine
            .storage
            .incomplete_index_scan(&driver_type.cursor_name())
            .await?;
        Ok(incomplete.map(|scan| StartOutcome::AlreadyRunning {
            scan: Box::new(scan),
        }))
    }

    /// Starts a run of `driver_type` over `(min, max]` if the cursor, the
    /// dependencies and the start lease allow it.
    pub async fn start(
        &self,
        driver_type: &DriverType,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
    ) -> Result<StartOutcome> {
        self.start_scan(driver_type, min, max, false).await
    }

    /// Like [`start`](Self::start). With `continue_update` set, finalizing
    /// the new scan runs [`update_all`](Self::update_all) up to its max.
    async fn start_scan(
        &self,
        driver_type: &DriverType,
        min: Option<DateTime<Utc>>,
        max: Option<DateTime<Utc>>,
        continue_update: bool,
    ) -> Result<StartOutcome> {
        self.engine.drivers.get(driver_type)?;
        if *driver_type == DriverType::find_latest_leaves() {
            return Err(ScanError::InvalidArgument(format!(
                "{driver_type} only runs on behalf of another scan"
            )));
        }

        if let Some(outcome) = self.disabled_or_started(driver_type).await? {
            return Ok(outcome);
        }

        let cursor = self.get_cursor(driver_type).await?;
        let mut min = min.unwrap_or_else(epoch);
        let mut used_cursor = false;
        if cursor.value > min {
            min = cursor.value;
            used_cursor = true;
        }

        let (dependency_max, dependency) = self.dependency_max(driver_type).await?;
        if dependency_max <= epoch() {
            return Ok(StartOutcome::Blocked { dependency });
        }

        let (max, took_dependency_max) = match max {
            None => (dependency_max, true),
            Some(max) if max > dependency_max => {
                return Ok(StartOutcome::Blocked { dependency });
            }
            Some(max) => (max, false),
        };

        if !used_cursor && max < min {
            min = epoch();
        }
        if min > max {
            return Ok(StartOutcome::MinAfterMax);
        }
        if !took_dependency_max && min == max {
            return Ok(StartOutcome::FullyCaughtUpWithMax);
        }
        if min == dependency_max {
            return Ok(StartOutcome::FullyCaughtUpWithDependency { dependency });
        }

        let lease_name = format!("Start-{}", cursor.name);
        let Some(lease) = HeldLease::acquire(
            Arc::clone(&self.engine.leases),
            &lease_name,
            &self.engine.config.lease,
        )
        .await?
        else {
            return Ok(StartOutcome::UnavailableLease);
        };

        let result = self
            .start_under_lease(driver_type, &cursor.name, min, max, continue_update)
            .await;
        if let Err(err) = lease.release().await {
            warn!(
                target: "catscan::cursor",
                lease = %lease_name,
                "failed to release start lease: {err}"
            );
        }
        result
    }

    async fn start_under_lease(
        &self,
        driver_type: &DriverType,
        cursor_name: &str,
        min: DateTime<Utc>,
        max: DateTime<Utc>,
        continue_update: bool,
    ) -> Result<StartOutcome> {
        if let Some(outcome) = self.disabled_or_started(driver_type).await? {
            return Ok(outcome);
        }

        let now = self.engine.now();
        let scan_id = ScanId::descending(now);
        let suffix = scan_id.unique_part().to_string();
        let mut scan = IndexScan::new(cursor_name, scan_id, suffix, driver_type.clone(), now);
        scan.min = Some(min);
        scan.max = Some(max);
        scan.continue_update = continue_update;

        if !self.engine.storage.insert_index_scan(&mut scan).await? {
            return Err(ScanError::invariant(format!(
                "scan id {} already exists",
                scan.scan_id
            )));
        }
        self.engine
            .enqueue(vec![scan.message()], Duration::ZERO)
            .await?;

        info!(
            target: "catscan::cursor",
            driver = %driver_type,
            scan_id = %scan.scan_id,
            %min,
            %max,
            "started catalog scan"
        );
        Ok(StartOutcome::NewStarted {
            scan: Box::new(scan),
        })
    }

    /// Tries to start every startable driver, in sorted order. With no
    /// explicit max, every driver is capped at the catalog's current commit.
    /// Scans started here carry `continue_update`, so each completion retries
    /// the drivers that were waiting on it.
    pub async fn update_all(
        &self,
        max: Option<DateTime<Utc>>,
    ) -> Result<Vec<(DriverType, Result<StartOutcome>)>> {
        let max = match max {
            Some(max) => max,
            None => self.source_value(&DependencySource::catalog()).await?,
        };

        let mut outcomes = Vec::new();
        for driver_type in self.engine.drivers.startable() {
            let outcome = self.start_scan(&driver_type, None, Some(max), true).await;
            match &outcome {
                Ok(StartOutcome::NewStarted { scan }) => info!(
                    target: "catscan::cursor",
                    driver = %driver_type,
                    scan_id = %scan.scan_id,
                    %max,
                    "started catalog scan"
                ),
                Ok(other) => info!(
                    target: "catscan::cursor",
                    driver = %driver_type,
                    outcome = other.label(),
                    "catalog scan did not start"
                ),
                Err(err) => error!(
                    target: "catscan::cursor",
                    driver = %driver_type,
                    "failed to start catalog scan: {err}"
                ),
            }
            outcomes.push((driver_type, outcome));
        }
        Ok(outcomes)
    }

    /// Returns the find-latest pre-pass for `parent`, starting it if needed.
    /// `None` means another worker holds the start lease; try again later.
    pub async fn get_or_start_find_latest(&self, parent: &IndexScan) -> Result<Option<IndexScan>> {
        let child_id = parent.scan_id.find_latest_child();
        if let Some(child) = self.engine.storage.get_index_scan("", &child_id).await? {
            return Ok(Some(child));
        }

        let driver_type = DriverType::find_latest_leaves();
        let lease_name = format!("Start-{}", driver_type.cursor_name());
        let Some(lease) = HeldLease::acquire(
            Arc::clone(&self.engine.leases),
            &lease_name,
            &self.engine.config.lease,
        )
        .await?
        else {
            debug!(
                target: "catscan::cursor",
                parent = %parent.scan_id,
                "find-latest start lease is busy"
            );
            return Ok(None);
        };

        let result = self.start_find_latest(parent, child_id, driver_type).await;
        if let Err(err) = lease.release().await {
            warn!(
                target: "catscan::cursor",
                lease = %lease_name,
                "failed to release start lease: {err}"
            );
        }
        result.map(Some)
    }

    async fn start_find_latest(
        &self,
        parent: &IndexScan,
        child_id: ScanId,
        driver_type: DriverType,
    ) -> Result<IndexScan> {
        if let Some(child) = self.engine.storage.get_index_scan("", &child_id).await? {
            return Ok(child);
        }

        let parent_ref = ParentScan::of(parent);
        let suffix = format!("{}fl", parent.storage_suffix);
        let mut child = IndexScan::new("", child_id, suffix, driver_type, self.engine.now());
        child.driver_parameters = Some(serde_json::to_string(&parent_ref)?);
        child.parent = Some(parent_ref);
        child.min = parent.min;
        child.max = parent.max;

        if !self.engine.storage.insert_index_scan(&mut child).await? {
            return self
                .engine
                .storage
                .get_index_scan("", &child.scan_id)
                .await?
                .ok_or_else(|| ScanError::invariant("find-latest scan vanished during start"));
        }
        self.engine
            .enqueue(vec![child.message()], Duration::ZERO)
            .await?;

        info!(
            target: "catscan::cursor",
            parent = %parent.scan_id,
            scan_id = %child.scan_id,
            "started find-latest-leaves pre-pass"
        );
        Ok(child)
    }

    /// Moves a cursor forward to `value`. Never moves it backwards; returns
    /// whether the stored value changed.
    pub async fn advance_cursor(&self, name: &str, value: DateTime<Utc>) -> Result<bool> {
        for _ in 0..CURSOR_WRITE_ATTEMPTS {
            let mut cursor = self.engine.storage.get_cursor(name).await?;
            if cursor.value >= value {
                debug!(
                    target: "catscan::cursor",
                    cursor = name,
                    current = %cursor.value,
                    %value,
                    "cursor already at or past value"
                );
                return Ok(false);
            }
            let previous = cursor.value;
            cursor.value = value;
            match self.engine.storage.save_cursor(&mut cursor).await? {
                WriteOutcome::Written(_) => {
                    info!(
                        target: "catscan::cursor",
                        cursor = name,
                        %previous,
                        %value,
                        "advanced cursor"
                    );
                    return Ok(true);
                }
                WriteOutcome::Conflict | WriteOutcome::Missing => {
                    debug!(
                        target: "catscan::cursor",
                        cursor = name,
                        "cursor write conflicted; re-reading"
                    );
                }
            }
        }
        Err(ScanError::Storage(format!(
            "cursor {name} kept changing; gave up after {CURSOR_WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Stops the in-flight run of a driver. The cursor is left where it is.
    pub async fn abort(&self, driver_type: &DriverType) -> Result<Option<IndexScan>> {
        let driver = self.engine.drivers.scan_driver(driver_type)?;
        let cursor_name = driver_type.cursor_name();
        let Some(mut scan) = self.engine.storage.incomplete_index_scan(&cursor_name).await? else {
            return Ok(None);
        };

        if scan.mode == Some(IndexScanMode::ExpandLatestLeaves) {
            let child_id = scan.scan_id.find_latest_child();
            if let Some(child) = self.engine.storage.get_index_scan("", &child_id).await? {
                self.engine.storage.delete_child_tables(&child.storage_suffix).await?;
                self.engine.storage.delete_index_scan(&child).await?;
            }
        }

        driver.finalize(&scan).await?;
        if !scan.storage_suffix.is_empty() {
            self.engine.storage.delete_child_tables(&scan.storage_suffix).await?;
        }

        for _ in 0..ABORT_WRITE_ATTEMPTS {
            scan.state = IndexScanState::Aborted;
            scan.completed = Some(self.engine.now());
            match self.engine.storage.replace_index_scan(&mut scan).await? {
                WriteOutcome::Written(_) => {
                    warn!(
                        target: "catscan::cursor",
                        driver = %driver_type,
                        scan_id = %scan.scan_id,
                        "aborted catalog scan"
                    );
                    return Ok(Some(scan));
                }
                WriteOutcome::Missing => return Ok(None),
                WriteOutcome::Conflict => {
                    let Some(fresh) = self
                        .engine
                        .storage
                        .get_index_scan(&scan.cursor_name, &scan.scan_id)
                        .await?
                    else {
                        return Ok(None);
                    };
                    scan = fresh;
                }
            }
        }
        Err(ScanError::Storage(format!(
            "scan {} kept changing while aborting",
            scan.scan_id
        )))
    }

    /// Re-enqueues every remaining leaf and page of a waiting scan, then the
    /// scan itself. Recovers scans whose messages were lost. Returns `None`
    /// when the scan is not waiting.
    pub async fn requeue(
        &self,
        driver_type: &DriverType,
        scan_id: &ScanId,
    ) -> Result<Option<RequeueCounts>> {
        let cursor_name = driver_type.cursor_name();
        let scan = self
            .engine
            .storage
            .get_index_scan(&cursor_name, scan_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("scan {scan_id} for {cursor_name}")))?;
        if scan.state != IndexScanState::Waiting {
            info!(
                target: "catscan::cursor",
                scan_id = %scan_id,
                state = %scan.state,
                "scan is not waiting; nothing to requeue"
            );
            return Ok(None);
        }

        let storage = &self.engine.storage;
        let leaves: Vec<ScanMessage> = storage
            .list_leaf_scans(&scan.storage_suffix, &scan.scan_id)
            .await?
            .iter()
            .map(|leaf| leaf.message().into())
            .collect();
        let pages: Vec<ScanMessage> = storage
            .list_page_scans(&scan.storage_suffix, &scan.scan_id)
            .await?
            .iter()
            .map(|page| page.message().into())
            .collect();
        let counts = RequeueCounts {
            leaves: leaves.len(),
            pages: pages.len(),
        };

        self.engine.enqueue(leaves, Duration::ZERO).await?;
        self.engine.enqueue(pages, Duration::ZERO).await?;
        self.engine
            .enqueue(vec![scan.message()], Duration::ZERO)
            .await?;

        info!(
            target: "catscan::cursor",
            scan_id = %scan_id,
            leaves = counts.leaves,
            pages = counts.pages,
            "requeued waiting scan"
        );
        Ok(Some(counts))
    }

    pub async fn status(&self, driver_type: &DriverType) -> Result<CursorStatus> {
        let dependencies = self.engine.drivers.get(driver_type)?.dependencies.clone();
        let cursor = self.get_cursor(driver_type).await?;
        let (dependency_max, _) = self.dependency_max(driver_type).await?;
        let latest_scans = self
            .engine
            .storage
            .list_index_scans(
                &cursor.name,
                Some(self.engine.config.latest_scan_lookup_limit),
            )
            .await?;
        Ok(CursorStatus {
            driver_type: driver_type.clone(),
            cursor,
            dependencies,
            dependency_max,
            latest_scans,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::EngineConfig;
    use crate::driver::{CatalogScanDriver, DriverRegistry, PageScanResult, RegisteredDriver};
    use crate::engine::{EngineComponents, ScanEngine};
    use catscan_model::{CatalogIndex, PageScan};
    use chrono::TimeZone;

    struct Noop;

    #[async_trait]
    impl CatalogScanDriver for Noop {
        async fn process_index(&self, _scan: &IndexScan) -> anyhow::Result<IndexScanMode> {
            Ok(IndexScanMode::Expand)
        }

        async fn process_page(&self, _page: &PageScan) -> anyhow::Result<PageScanResult> {
            Ok(PageScanResult::Processed)
        }
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 1, hour, 0, 0).unwrap()
    }

    async fn service(upstream: DateTime<Utc>) -> CursorService {
        let catalog = InMemoryCatalog::new();
        catalog
            .set_index(CatalogIndex {
                commit_timestamp: ts(20),
                count: None,
                items: Vec::new(),
            })
            .await;

        let mut drivers = DriverRegistry::new();
        drivers.register(
            "downstream",
            RegisteredDriver::new(Arc::new(Noop))
                .depends_on(vec![DependencySource::External("upstream".into())]),
        );
        let engine = ScanEngine::new(
            EngineComponents::in_memory(Arc::new(catalog)),
            drivers,
            EngineConfig::default(),
        );

        let mut upstream_cursor = MockExternalCursor::new();
        upstream_cursor
            .expect_value()
            .returning(move || Ok(upstream));
        CursorService::new(engine).with_external("upstream", Arc::new(upstream_cursor))
    }

    #[tokio::test]
    async fn blocked_while_dependency_is_at_epoch() {
        let cursors = service(epoch()).await;
        let outcome = cursors
            .start(&DriverType::from("downstream"), None, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Blocked {
                dependency: "upstream".into()
            }
        );
    }

    #[tokio::test]
    async fn explicit_max_beyond_dependency_is_blocked() {
        let cursors = service(ts(5)).await;
        let outcome = cursors
            .start(&DriverType::from("downstream"), None, Some(ts(6)))
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Blocked { .. }));
    }

    #[tokio::test]
    async fn caught_up_outcomes() {
        let cursors = service(ts(5)).await;
        let driver = DriverType::from("downstream");
        cursors
            .advance_cursor(&driver.cursor_name(), ts(5))
            .await
            .unwrap();

        assert_eq!(
            cursors.start(&driver, None, None).await.unwrap(),
            StartOutcome::FullyCaughtUpWithDependency {
                dependency: "upstream".into()
            }
        );
        assert_eq!(
            cursors.start(&driver, None, Some(ts(5))).await.unwrap(),
            StartOutcome::FullyCaughtUpWithMax
        );
        assert_eq!(
            cursors.start(&driver, None, Some(ts(4))).await.unwrap(),
            StartOutcome::MinAfterMax
        );
    }

    #[tokio::test]
    async fn requested_min_past_max_falls_back_to_epoch() {
        let cursors = service(ts(5)).await;
        let outcome = cursors
            .start(&DriverType::from("downstream"), Some(ts(4)), Some(ts(3)))
            .await
            .unwrap();
        let scan = outcome.scan().expect("scan started");
        assert_eq!(scan.min, Some(epoch()));
        assert_eq!(scan.max, Some(ts(3)));
    }

    #[tokio::test]
    async fn second_start_reports_running_scan() {
        let cursors = service(ts(5)).await;
        let driver = DriverType::from("downstream");
        let first = cursors.start(&driver, None, None).await.unwrap();
        let second = cursors.start(&driver, None, None).await.unwrap();

        assert_eq!(first.label(), "new_started");
        assert_eq!(second.label(), "already_running");
        assert_eq!(
            first.scan().map(|s| &s.scan_id),
            second.scan().map(|s| &s.scan_id)
        );
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let cursors = service(ts(5)).await;
        assert!(cursors.advance_cursor("c", ts(3)).await.unwrap());
        assert!(!cursors.advance_cursor("c", ts(2)).await.unwrap());
        assert!(!cursors.advance_cursor("c", ts(3)).await.unwrap());
        assert!(cursors.advance_cursor("c", ts(4)).await.unwrap());
        let cursor = cursors.engine.storage.get_cursor("c").await.unwrap();
        assert_eq!(cursor.value, ts(4));
    }

    #[tokio::test]
    async fn concurrent_advances_keep_the_highest_value() {
        let cursors = service(ts(5)).await;
        let (a, b, c, d) = tokio::join!(
            cursors.advance_cursor("c", ts(2)),
            cursors.advance_cursor("c", ts(4)),
            cursors.advance_cursor("c", ts(3)),
            cursors.advance_cursor("c", ts(1)),
        );
        assert!(b.unwrap());
        for result in [a, c, d] {
            result.unwrap();
        }
        let cursor = cursors.engine.storage.get_cursor("c").await.unwrap();
        assert_eq!(cursor.value, ts(4));

        assert!(!cursors.advance_cursor("c", ts(3)).await.unwrap());
        let cursor = cursors.engine.storage.get_cursor("c").await.unwrap();
        assert_eq!(cursor.value, ts(4));
    }

    #[tokio::test]
    async fn unknown_driver_is_an_error() {
        let cursors = service(ts(5)).await;
        let err = cursors
            .start(&DriverType::from("nope"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::UnknownDriver(_)));
    }
}
