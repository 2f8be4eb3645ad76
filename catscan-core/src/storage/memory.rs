use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{EntityRow, EntityStore, InsertOutcome, WriteOutcome};
use crate::error::Result;

type Key = (String, String);

#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, BTreeMap<Key, (u64, serde_json::Value)>>,
    next_version: u64,
}

impl Tables {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Process-local entity store used by tests and single-node runs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEntityStore {
    inner: Arc<Mutex<Tables>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        let guard = self.inner.lock().await;
        guard.tables.get(table).map(BTreeMap::len).unwrap_or_default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        let guard = self.inner.lock().await;
        let mut names: Vec<String> = guard
            .tables
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

fn to_row(key: &Key, version: u64, body: &serde_json::Value) -> EntityRow {
    EntityRow {
        partition_key: key.0.clone(),
        row_key: key.1.clone(),
        version,
        body: body.clone(),
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<EntityRow>> {
        let guard = self.inner.lock().await;
        let key = (partition_key.to_string(), row_key.to_string());
        Ok(guard
            .tables
            .get(table)
            .and_then(|rows| rows.get(&key))
            .map(|(version, body)| to_row(&key, *version, body)))
    }

    async fn query_partition(
        &self,
        table: &str,
        partition_key: &str,
    ) -> Result<Vec<EntityRow>> {
        let guard = self.inner.lock().await;
        let Some(rows) = guard.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|(key, _)| key.0 == partition_key)
            .map(|(key, (version, body))| to_row(key, *version, body))
            .collect())
    }

    async fn query_prefix(
        &self,
        table: &str,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EntityRow>> {
        let guard = self.inner.lock().await;
        let Some(rows) = guard.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|(key, _)| key.0.starts_with(prefix))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(key, (version, body))| to_row(key, *version, body))
            .collect())
    }

    async fn insert(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        body: serde_json::Value,
    ) -> Result<InsertOutcome> {
        let mut guard = self.inner.lock().await;
        let key = (partition_key.to_string(), row_key.to_string());
        let exists = guard
            .tables
            .get(table)
            .is_some_and(|rows| rows.contains_key(&key));
        if exists {
            return Ok(InsertOutcome::AlreadyExists);
        }

        let version = guard.bump();
        guard
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key, (version, body));
        Ok(InsertOutcome::Inserted(version))
    }

    async fn replace(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_version: u64,
        body: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let mut guard = self.inner.lock().await;
        let key = (partition_key.to_string(), row_key.to_string());
        let current = guard
            .tables
            .get(table)
            .and_then(|rows| rows.get(&key))
            .map(|(version, _)| *version);
        match current {
            None => Ok(WriteOutcome::Missing),
            Some(version) if version != expected_version => {
                Ok(WriteOutcome::Conflict)
            }
            Some(_) => {
                let version = guard.bump();
                guard
                    .tables
                    .entry(table.to_string())
                    .or_default()
                    .insert(key, (version, body));
                Ok(WriteOutcome::Written(version))
            }
        }
    }

    async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
        expected_version: Option<u64>,
    ) -> Result<WriteOutcome> {
        let mut guard = self.inner.lock().await;
        let key = (partition_key.to_string(), row_key.to_string());
        let Some(rows) = guard.tables.get_mut(table) else {
            return Ok(WriteOutcome::Missing);
        };
        let Some((version, _)) = rows.get(&key) else {
            return Ok(WriteOutcome::Missing);
        };
        let version = *version;
        if expected_version.is_some_and(|expected| expected != version) {
            return Ok(WriteOutcome::Conflict);
        }
        rows.remove(&key);
        Ok(WriteOutcome::Written(version))
    }

    async fn delete_table(&self, table: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.tables.remove(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replace_requires_matching_version() {
        let store = InMemoryEntityStore::new();
        let InsertOutcome::Inserted(v1) =
            store.insert("t", "p", "r", json!({"n": 1})).await.unwrap()
        else {
            panic!("expected insert");
        };

        let stale = store
            .replace("t", "p", "r", v1 + 100, json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(stale, WriteOutcome::Conflict);

        let fresh = store.replace("t", "p", "r", v1, json!({"n": 3})).await.unwrap();
        assert!(fresh.is_written());

        let row = store.get("t", "p", "r").await.unwrap().unwrap();
        assert_eq!(row.body["n"], 3);
        assert_ne!(row.version, v1);
    }

    #[tokio::test]
    async fn duplicate_insert_reports_existing_row() {
        let store = InMemoryEntityStore::new();
        store.insert("t", "p", "r", json!({})).await.unwrap();
        let again = store.insert("t", "p", "r", json!({})).await.unwrap();
        assert_eq!(again, InsertOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn prefix_query_honours_limit_and_order() {
        let store = InMemoryEntityStore::new();
        for (pk, rk) in [("s1-P2", "L1"), ("s1-P1", "L2"), ("s1-P1", "L1"), ("s2-P1", "L1")] {
            store.insert("leaves", pk, rk, json!({})).await.unwrap();
        }

        let rows = store.query_prefix("leaves", "s1-", None).await.unwrap();
        let keys: Vec<_> = rows
            .iter()
            .map(|r| (r.partition_key.as_str(), r.row_key.as_str()))
            .collect();
        assert_eq!(keys, vec![("s1-P1", "L1"), ("s1-P1", "L2"), ("s1-P2", "L1")]);

        let limited = store.query_prefix("leaves", "s1-", Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store.query_prefix("missing", "", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_version_checked() {
        let store = InMemoryEntityStore::new();
        store.insert("t", "p", "r", json!({})).await.unwrap();
        let row = store.get("t", "p", "r").await.unwrap().unwrap();

        let wrong = store.delete("t", "p", "r", Some(row.version + 1)).await.unwrap();
        assert_eq!(wrong, WriteOutcome::Conflict);

        let ok = store.delete("t", "p", "r", Some(row.version)).await.unwrap();
        assert!(ok.is_written());

        let gone = store.delete("t", "p", "r", None).await.unwrap();
        assert_eq!(gone, WriteOutcome::Missing);
    }
}
