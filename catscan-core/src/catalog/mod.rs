//! Read-only access to the catalog feed.

use std::fmt;

use async_trait::async_trait;
use catscan_model::{CatalogIndex, CatalogPage};

use crate::error::Result;

pub mod http;
pub mod memory;

pub use http::HttpCatalogClient;
pub use memory::InMemoryCatalog;

#[async_trait]
pub trait CatalogSource: Send + Sync + fmt::Debug {
    async fn get_index(&self) -> Result<CatalogIndex>;

    async fn get_page(&self, url: &str) -> Result<CatalogPage>;
}
