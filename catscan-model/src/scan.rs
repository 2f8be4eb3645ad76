//! Persisted scan records. Records carry an explicit `version` token that
//! storage fills in on read; writes compare it to detect lost updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    catalog::LeafType,
    ids::{DriverType, ScanId},
    messages::{IndexScanMessage, LeafScanMessage, PageScanMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScanState {
    Created,
    WaitingOnDependency,
    Expanding,
    Enqueuing,
    Waiting,
    StartingAggregate,
    Aggregating,
    Finalizing,
    Complete,
    Aborted,
}

impl IndexScanState {
    pub fn is_terminal(self) -> bool {
        matches!(self, IndexScanState::Complete | IndexScanState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexScanState::Created => "created",
            IndexScanState::WaitingOnDependency => "waiting_on_dependency",
            IndexScanState::Expanding => "expanding",
            IndexScanState::Enqueuing => "enqueuing",
            IndexScanState::Waiting => "waiting",
            IndexScanState::StartingAggregate => "starting_aggregate",
            IndexScanState::Aggregating => "aggregating",
            IndexScanState::Finalizing => "finalizing",
            IndexScanState::Complete => "complete",
            IndexScanState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for IndexScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageScanState {
    Created,
    Expanding,
    Enqueuing,
    Complete,
}

/// Fan-out topology chosen by the driver when the index scan is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexScanMode {
    /// One page record per catalog page in bounds.
    Expand,
    /// Run a find-latest-leaves pre-pass, then process its leaves.
    ExpandLatestLeaves,
    /// The driver handled the index itself; go straight to aggregation.
    Processed,
}

/// Back-reference from an internal pre-pass scan to the scan that needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentScan {
    pub driver_type: DriverType,
    pub cursor_name: String,
    pub scan_id: ScanId,
    pub storage_suffix: String,
    #[serde(default)]
    pub driver_parameters: Option<String>,
}

impl ParentScan {
    pub fn of(scan: &IndexScan) -> Self {
        Self {
            driver_type: scan.driver_type.clone(),
            cursor_name: scan.cursor_name.clone(),
            scan_id: scan.scan_id.clone(),
            storage_suffix: scan.storage_suffix.clone(),
            driver_parameters: scan.driver_parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexScan {
    /// Empty for cursorless internal scans.
    pub cursor_name: String,
    pub scan_id: ScanId,
    pub storage_suffix: String,
    pub state: IndexScanState,
    pub driver_type: DriverType,
    #[serde(default)]
    pub driver_parameters: Option<String>,
    #[serde(default)]
    pub mode: Option<IndexScanMode>,
    #[serde(default)]
    pub parent: Option<ParentScan>,
    pub min: Option<DateTime<Utc>>,
    pub max: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    /// Set on scans started by an update-all pass; finalizing one starts
    /// another pass capped at its max.
    #[serde(default)]
    pub continue_update: bool,
    #[serde(skip)]
    pub version: u64,
}

impl IndexScan {
    pub fn new(
        cursor_name: impl Into<String>,
        scan_id: ScanId,
        storage_suffix: impl Into<String>,
        driver_type: DriverType,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            cursor_name: cursor_name.into(),
            scan_id,
            storage_suffix: storage_suffix.into(),
            state: IndexScanState::Created,
            driver_type,
            driver_parameters: None,
            mode: None,
            parent: None,
            min: None,
            max: None,
            created,
            started: None,
            completed: None,
            continue_update: false,
            version: 0,
        }
    }

    pub fn message(&self) -> IndexScanMessage {
        IndexScanMessage {
            cursor_name: self.cursor_name.clone(),
            scan_id: self.scan_id.clone(),
            attempt_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageScan {
    pub storage_suffix: String,
    pub scan_id: ScanId,
    pub page_id: String,
    pub state: PageScanState,
    pub url: String,
    pub rank: u32,
    pub driver_type: DriverType,
    #[serde(default)]
    pub driver_parameters: Option<String>,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    #[serde(skip)]
    pub version: u64,
}

impl PageScan {
    pub fn message(&self) -> PageScanMessage {
        PageScanMessage {
            storage_suffix: self.storage_suffix.clone(),
            scan_id: self.scan_id.clone(),
            page_id: self.page_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafScan {
    pub storage_suffix: String,
    pub scan_id: ScanId,
    pub page_id: String,
    pub leaf_id: String,
    pub url: String,
    pub leaf_type: LeafType,
    pub commit_id: String,
    pub commit_timestamp: DateTime<Utc>,
    pub package_id: String,
    pub package_version: String,
    pub driver_type: DriverType,
    #[serde(default)]
    pub driver_parameters: Option<String>,
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
    /// Earliest time the next attempt may run.
    #[serde(default)]
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: u64,
}

impl LeafScan {
    /// Partition shared by every leaf of one page of one scan.
    pub fn partition_key(scan_id: &ScanId, page_id: &str) -> String {
        format!("{scan_id}-{page_id}")
    }

    pub fn message(&self) -> LeafScanMessage {
        LeafScanMessage {
            storage_suffix: self.storage_suffix.clone(),
            scan_id: self.scan_id.clone(),
            page_id: self.page_id.clone(),
            leaf_id: self.leaf_id.clone(),
        }
    }
}
