//! Data model shared by the catscan crates: scan records and their states,
//! queue messages, catalog feed documents and cursors.
#![allow(missing_docs)]

pub mod catalog;
pub mod cursor;
pub mod error;
pub mod ids;
pub mod messages;
pub mod scan;

pub use catalog::{
    CatalogIndex, CatalogLeafItem, CatalogPage, CatalogPageItem, LeafType,
    PackageIdentity,
};
pub use cursor::{CursorRecord, epoch};
pub use error::{ModelError, Result as ModelResult};
pub use ids::{DriverType, ScanId, leaf_id, page_id, parse_rank};
pub use messages::{
    IndexScanMessage, LeafScanMessage, PageScanMessage, ScanMessage,
};
pub use scan::{
    IndexScan, IndexScanMode, IndexScanState, LeafScan, PageScan,
    PageScanState, ParentScan,
};
