//! Typed access to index, page and leaf scan records and cursors.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use catscan_model::{CursorRecord, IndexScan, LeafScan, PageScan, ScanId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{EntityRow, EntityStore, InsertOutcome, WriteOutcome};
use crate::error::{Result, ScanError};

const INDEX_SCANS: &str = "indexscans";
const CURSORS: &str = "cursors";

pub fn page_table(suffix: &str) -> String {
    format!("pagescans{suffix}")
}

pub fn leaf_table(suffix: &str) -> String {
    format!("leafscans{suffix}")
}

fn decode<T: DeserializeOwned>(row: EntityRow) -> Result<(T, u64)> {
    let record = serde_json::from_value(row.body)?;
    Ok((record, row.version))
}

fn encode<T: Serialize>(record: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(record)?)
}

#[derive(Clone, Debug)]
pub struct CatalogScanStorage {
    store: Arc<dyn EntityStore>,
}

impl CatalogScanStorage {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn EntityStore> {
        Arc::clone(&self.store)
    }

    // Index scans

    pub async fn get_index_scan(
        &self,
        cursor_name: &str,
        scan_id: &ScanId,
    ) -> Result<Option<IndexScan>> {
        let Some(row) = self
            .store
            .get(INDEX_SCANS, cursor_name, scan_id.as_str())
            .await?
        else {
            return Ok(None);
        };
        let (mut scan, version): (IndexScan, u64) = decode(row)?;
        scan.version = version;
        Ok(Some(scan))
    }

    /// Scans for a cursor, newest first.
    pub async fn list_index_scans(
        &self,
        cursor_name: &str,
        limit: Option<usize>,
    ) -> Result<Vec<IndexScan>> {
        let rows = self.store.query_partition(INDEX_SCANS, cursor_name).await?;
        rows.into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|row| {
                let (mut scan, version): (IndexScan, u64) = decode(row)?;
                scan.version = version;
                Ok(scan)
            })
            .collect()
    }

    /// The single in-flight scan for a cursor, if any. More than one is an
    /// invariant violation and is reported instead of guessed around.
    pub async fn incomplete_index_scan(
        &self,
        cursor_name: &str,
    ) -> Result<Option<IndexScan>> {
        let mut incomplete: Vec<IndexScan> = self
            .list_index_scans(cursor_name, None)
            .await?
            .into_iter()
            .filter(|scan| !scan.state.is_terminal())
            .collect();

        if incomplete.len() > 1 {
            let ids: Vec<String> =
                incomplete.iter().map(|s| s.scan_id.to_string()).collect();
            return Err(ScanError::invariant(format!(
                "cursor {cursor_name} has {} incomplete scans: {}",
                ids.len(),
                ids.join(", ")
            )));
        }
        Ok(incomplete.pop())
    }

    /// Inserts a new scan. Returns `false` when one with the same id exists.
    pub async fn insert_index_scan(&self, scan: &mut IndexScan) -> Result<bool> {
        let body = encode(scan)?;
        match self
            .store
            .insert(INDEX_SCANS, &scan.cursor_name, scan.scan_id.as_str(), body)
            .await?
        {
            InsertOutcome::Inserted(version) => {
                scan.version = version;
                Ok(true)
            }
            InsertOutcome::AlreadyExists => Ok(false),
        }
    }

    pub async fn replace_index_scan(
        &self,
        scan: &mut IndexScan,
    ) -> Result<WriteOutcome> {
        let body = encode(scan)?;
        let outcome = self
            .store
            .replace(
                INDEX_SCANS,
                &scan.cursor_name,
                scan.scan_id.as_str(),
                scan.version,
                body,
            )
            .await?;
        if let WriteOutcome::Written(version) = outcome {
            scan.version = version;
        }
        Ok(outcome)
    }

    pub async fn delete_index_scan(&self, scan: &IndexScan) -> Result<WriteOutcome> {
        self.store
            .delete(INDEX_SCANS, &scan.cursor_name, scan.scan_id.as_str(), None)
            .await
    }

    /// Deletes terminal scans older than `current`, past the newest `keep`
    /// older ones. Returns how many were deleted.
    pub async fn prune_index_scans(
        &self,
        cursor_name: &str,
        current: &ScanId,
        keep: usize,
    ) -> Result<usize> {
        let old: Vec<IndexScan> = self
            .list_index_scans(cursor_name, None)
            .await?
            .into_iter()
            .filter(|scan| scan.scan_id > *current)
            .skip(keep)
            .filter(|scan| scan.state.is_terminal())
            .collect();

        let mut deleted = 0;
        for scan in &old {
            if self.delete_index_scan(scan).await?.is_written() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    // Page scans

    pub async fn get_page_scan(
        &self,
        suffix: &str,
        scan_id: &ScanId,
        page_id: &str,
    ) -> Result<Option<PageScan>> {
        let Some(row) = self
            .store
            .get(&page_table(suffix), scan_id.as_str(), page_id)
            .await?
        else {
            return Ok(None);
        };
        let (mut page, version): (PageScan, u64) = decode(row)?;
        page.version = version;
        Ok(Some(page))
    }

    pub async fn list_page_scans(
        &self,
        suffix: &str,
        scan_id: &ScanId,
    ) -> Result<Vec<PageScan>> {
        let rows = self
            .store
            .query_partition(&page_table(suffix), scan_id.as_str())
            .await?;
        rows.into_iter()
            .map(|row| {
                let (mut page, version): (PageScan, u64) = decode(row)?;
                page.version = version;
                Ok(page)
            })
            .collect()
    }

    /// Inserts page records, skipping any that already exist.
    pub async fn insert_page_scans(&self, pages: &[PageScan]) -> Result<usize> {
        let mut inserted = 0;
        for page in pages {
            let body = encode(page)?;
            let outcome = self
                .store
                .insert(
                    &page_table(&page.storage_suffix),
                    page.scan_id.as_str(),
                    &page.page_id,
                    body,
                )
                .await?;
            if matches!(outcome, InsertOutcome::Inserted(_)) {
                inserted += 1;
            }
        }
        debug!(inserted, total = pages.len(), "inserted page scans");
        Ok(inserted)
    }

    pub async fn replace_page_scan(&self, page: &mut PageScan) -> Result<WriteOutcome> {
        let body = encode(page)?;
        let outcome = self
            .store
            .replace(
                &page_table(&page.storage_suffix),
                page.scan_id.as_str(),
                &page.page_id,
                page.version,
                body,
            )
            .await?;
        if let WriteOutcome::Written(version) = outcome {
            page.version = version;
        }
        Ok(outcome)
    }

    pub async fn delete_page_scan(&self, page: &PageScan) -> Result<WriteOutcome> {
        self.store
            .delete(
                &page_table(&page.storage_suffix),
                page.scan_id.as_str(),
                &page.page_id,
                None,
            )
            .await
    }

    /// `0` means no page records remain; otherwise at least one does.
    pub async fn page_scan_count_lower_bound(
        &self,
        suffix: &str,
        scan_id: &ScanId,
    ) -> Result<usize> {
        let rows = self
            .store
            .query_prefix(&page_table(suffix), scan_id.as_str(), Some(1))
            .await?;
        Ok(rows.len())
    }

    // Leaf scans

    pub async fn get_leaf_scan(
        &self,
        suffix: &str,
        scan_id: &ScanId,
        page_id: &str,
        leaf_id: &str,
    ) -> Result<Option<LeafScan>> {
        let partition = LeafScan::partition_key(scan_id, page_id);
        let Some(row) = self.store.get(&leaf_table(suffix), &partition, leaf_id).await?
        else {
            return Ok(None);
        };
        let (mut leaf, version): (LeafScan, u64) = decode(row)?;
        leaf.version = version;
        Ok(Some(leaf))
    }

    /// Leaf records of one page, keyed by leaf id, restricted to `leaf_ids`.
    pub async fn get_leaf_scans(
        &self,
        suffix: &str,
        scan_id: &ScanId,
        page_id: &str,
        leaf_ids: &HashSet<&str>,
    ) -> Result<HashMap<String, LeafScan>> {
        let mut found = HashMap::new();
        for leaf in self.list_page_leaf_scans(suffix, scan_id, page_id).await? {
            if leaf_ids.contains(leaf.leaf_id.as_str()) {
                found.insert(leaf.leaf_id.clone(), leaf);
            }
        }
        Ok(found)
    }

    pub async fn list_page_leaf_scans(
        &self,
        suffix: &str,
        scan_id: &ScanId,
        page_id: &str,
    ) -> Result<Vec<LeafScan>> {
        let partition = LeafScan::partition_key(scan_id, page_id);
        let rows = self
            .store
            .query_partition(&leaf_table(suffix), &partition)
            .await?;
        rows.into_iter().map(Self::decode_leaf).collect()
    }

    /// Every remaining leaf record of a scan.
    pub async fn list_leaf_scans(
        &self,
        suffix: &str,
        scan_id: &ScanId,
    ) -> Result<Vec<LeafScan>> {
        let prefix = LeafScan::partition_key(scan_id, "");
        let rows = self
            .store
            .query_prefix(&leaf_table(suffix), &prefix, None)
            .await?;
        rows.into_iter().map(Self::decode_leaf).collect()
    }

    pub async fn leaf_scan_count_lower_bound(
        &self,
        suffix: &str,
        scan_id: &ScanId,
    ) -> Result<usize> {
        let prefix = LeafScan::partition_key(scan_id, "");
        let rows = self
            .store
            .query_prefix(&leaf_table(suffix), &prefix, Some(1))
            .await?;
        Ok(rows.len())
    }

    fn decode_leaf(row: EntityRow) -> Result<LeafScan> {
        let (mut leaf, version): (LeafScan, u64) = decode(row)?;
        leaf.version = version;
        Ok(leaf)
    }

    pub async fn insert_leaf_scans(&self, leaves: &[LeafScan]) -> Result<usize> {
        let mut inserted = 0;
        for leaf in leaves {
            if self.insert_leaf_scan(&mut leaf.clone()).await? {
                inserted += 1;
            }
        }
        debug!(inserted, total = leaves.len(), "inserted leaf scans");
        Ok(inserted)
    }

    pub async fn insert_leaf_scan(&self, leaf: &mut LeafScan) -> Result<bool> {
        let body = encode(leaf)?;
        let partition = LeafScan::partition_key(&leaf.scan_id, &leaf.page_id);
        match self
            .store
            .insert(&leaf_table(&leaf.storage_suffix), &partition, &leaf.leaf_id, body)
            .await?
        {
            InsertOutcome::Inserted(version) => {
                leaf.version = version;
                Ok(true)
            }
            InsertOutcome::AlreadyExists => Ok(false),
        }
    }

    pub async fn replace_leaf_scan(&self, leaf: &mut LeafScan) -> Result<WriteOutcome> {
        let body = encode(leaf)?;
        let partition = LeafScan::partition_key(&leaf.scan_id, &leaf.page_id);
        let outcome = self
            .store
            .replace(
                &leaf_table(&leaf.storage_suffix),
                &partition,
                &leaf.leaf_id,
                leaf.version,
                body,
            )
            .await?;
        if let WriteOutcome::Written(version) = outcome {
            leaf.version = version;
        }
        Ok(outcome)
    }

    pub async fn delete_leaf_scan(&self, leaf: &LeafScan) -> Result<WriteOutcome> {
        let partition = LeafScan::partition_key(&leaf.scan_id, &leaf.page_id);
        self.store
            .delete(
                &leaf_table(&leaf.storage_suffix),
                &partition,
                &leaf.leaf_id,
                Some(leaf.version),
            )
            .await
    }

    /// Removes the page and leaf tables owned by a storage suffix.
    pub async fn delete_child_tables(&self, suffix: &str) -> Result<()> {
        if suffix.is_empty() {
            return Err(ScanError::invariant(
                "refusing to delete unsuffixed child tables",
            ));
        }
        self.store.delete_table(&page_table(suffix)).await?;
        self.store.delete_table(&leaf_table(suffix)).await?;
        info!(suffix, "deleted suffixed scan state tables");
        Ok(())
    }

    // Cursors

    /// Reads a cursor; a cursor that was never written reads as the epoch.
    pub async fn get_cursor(&self, name: &str) -> Result<CursorRecord> {
        match self.store.get(CURSORS, name, "").await? {
            Some(row) => {
                let (mut cursor, version): (CursorRecord, u64) = decode(row)?;
                cursor.version = version;
                Ok(cursor)
            }
            None => Ok(CursorRecord::new(name)),
        }
    }

    /// Version-checked write; a never-saved cursor is inserted.
    pub async fn save_cursor(&self, cursor: &mut CursorRecord) -> Result<WriteOutcome> {
        let body = encode(cursor)?;
        let outcome = if cursor.version == 0 {
            match self.store.insert(CURSORS, &cursor.name, "", body).await? {
                InsertOutcome::Inserted(version) => WriteOutcome::Written(version),
                InsertOutcome::AlreadyExists => WriteOutcome::Conflict,
            }
        } else {
            self.store
                .replace(CURSORS, &cursor.name, "", cursor.version, body)
                .await?
        };
        if let WriteOutcome::Written(version) = outcome {
            cursor.version = version;
        }
        Ok(outcome)
    }
}
