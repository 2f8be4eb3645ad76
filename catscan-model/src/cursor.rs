use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel value of a cursor that has never advanced.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Persisted high-water mark for one cursor name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub name: String,
    pub value: DateTime<Utc>,
    /// Optimistic concurrency token assigned by storage; `0` when unsaved.
    #[serde(skip)]
    pub version: u64,
}

impl CursorRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: epoch(),
            version: 0,
        }
    }

    pub fn is_at_epoch(&self) -> bool {
        self.value == epoch()
    }
}
