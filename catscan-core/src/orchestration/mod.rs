//! Message processors for the three scan levels.

pub mod expander;
pub mod index;
pub mod leaf;
pub mod page;
pub mod retry;

pub use index::IndexScanProcessor;
pub use leaf::{LeafDelivery, LeafDisposition, LeafScanProcessor};
pub use page::PageScanProcessor;
pub use retry::leaf_backoff;
