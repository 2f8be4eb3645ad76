use serde::{Deserialize, Serialize};

use crate::ids::ScanId;

/// Every message the scan engine exchanges through the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanMessage {
    Index(IndexScanMessage),
    Page(PageScanMessage),
    Leaf(LeafScanMessage),
}

impl ScanMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ScanMessage::Index(_) => "index",
            ScanMessage::Page(_) => "page",
            ScanMessage::Leaf(_) => "leaf",
        }
    }

    pub fn scan_id(&self) -> &ScanId {
        match self {
            ScanMessage::Index(m) => &m.scan_id,
            ScanMessage::Page(m) => &m.scan_id,
            ScanMessage::Leaf(m) => &m.scan_id,
        }
    }
}

/// Drives one index scan. `attempt_count` only paces the self-requeue loop
/// and is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexScanMessage {
    pub cursor_name: String,
    pub scan_id: ScanId,
    #[serde(default)]
    pub attempt_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageScanMessage {
    pub storage_suffix: String,
    pub scan_id: ScanId,
    pub page_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeafScanMessage {
    pub storage_suffix: String,
    pub scan_id: ScanId,
    pub page_id: String,
    pub leaf_id: String,
}

impl From<IndexScanMessage> for ScanMessage {
    fn from(value: IndexScanMessage) -> Self {
        ScanMessage::Index(value)
    }
}

impl From<PageScanMessage> for ScanMessage {
    fn from(value: PageScanMessage) -> Self {
        ScanMessage::Page(value)
    }
}

impl From<LeafScanMessage> for ScanMessage {
    fn from(value: LeafScanMessage) -> Self {
        ScanMessage::Leaf(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_by_kind() {
        let message = ScanMessage::Page(PageScanMessage {
            storage_suffix: "abc".into(),
            scan_id: "00000000000000000001-abc".parse().unwrap(),
            page_id: "P0000000001".into(),
        });

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "page");
        assert_eq!(json["page_id"], "P0000000001");

        let back: ScanMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn index_attempt_count_defaults_to_zero() {
        let raw = r#"{"type":"index","cursor_name":"c","scan_id":"00000000000000000001-x"}"#;
        let message: ScanMessage = serde_json::from_str(raw).unwrap();
        match message {
            ScanMessage::Index(index) => assert_eq!(index.attempt_count, 0),
            other => panic!("unexpected message {other:?}"),
        }
    }
}
