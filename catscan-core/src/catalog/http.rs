use std::fmt;

use async_trait::async_trait;
use catscan_model::{CatalogIndex, CatalogPage};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::CatalogSource;
use crate::config::CatalogConfig;
use crate::error::{Result, ScanError};

/// Catalog client speaking the NuGet V3 catalog JSON over HTTPS.
#[derive(Clone)]
pub struct HttpCatalogClient {
    client: Client,
    index_url: Url,
}

impl fmt::Debug for HttpCatalogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCatalogClient")
            .field("index_url", &self.index_url.as_str())
            .finish()
    }
}

impl HttpCatalogClient {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let index_url = Url::parse(&config.index_url)?;
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { client, index_url })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url, "fetching catalog document");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScanError::CatalogStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogClient {
    async fn get_index(&self) -> Result<CatalogIndex> {
        self.get_json(self.index_url.as_str()).await
    }

    async fn get_page(&self, url: &str) -> Result<CatalogPage> {
        let url = self.index_url.join(url)?;
        self.get_json(url.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_index_url() {
        let config = CatalogConfig {
            index_url: "not a url".into(),
            ..CatalogConfig::default()
        };
        assert!(matches!(
            HttpCatalogClient::new(&config),
            Err(ScanError::Url(_))
        ));
    }
}
