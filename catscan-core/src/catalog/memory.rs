use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use catscan_model::{CatalogIndex, CatalogPage};
use tokio::sync::RwLock;

use super::CatalogSource;
use crate::error::{Result, ScanError};

#[derive(Debug, Default)]
struct Documents {
    index: Option<CatalogIndex>,
    pages: HashMap<String, CatalogPage>,
}

/// Catalog served from memory. Counts fetches so callers can check that
/// documents are not re-read within one invocation.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    documents: Arc<RwLock<Documents>>,
    index_fetches: Arc<AtomicUsize>,
    page_fetches: Arc<AtomicUsize>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_index(&self, index: CatalogIndex) {
        self.documents.write().await.index = Some(index);
    }

    pub async fn set_page(&self, url: impl Into<String>, page: CatalogPage) {
        self.documents.write().await.pages.insert(url.into(), page);
    }

    pub fn index_fetches(&self) -> usize {
        self.index_fetches.load(Ordering::SeqCst)
    }

    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for InMemoryCatalog {
    async fn get_index(&self) -> Result<CatalogIndex> {
        self.index_fetches.fetch_add(1, Ordering::SeqCst);
        self.documents
            .read()
            .await
            .index
            .clone()
            .ok_or_else(|| ScanError::NotFound("catalog index".into()))
    }

    async fn get_page(&self, url: &str) -> Result<CatalogPage> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        self.documents
            .read()
            .await
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| ScanError::NotFound(format!("catalog page {url}")))
    }
}
