use catscan_model::{DriverType, ModelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Lease error: {0}")]
    Lease(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Catalog request to {url} returned status {status}")]
    CatalogStatus { url: String, status: u16 },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Unknown driver type: {0}")]
    UnknownDriver(DriverType),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Driver failed: {0:#}")]
    Driver(anyhow::Error),
}

impl ScanError {
    pub fn invariant(message: impl Into<String>) -> Self {
        ScanError::Invariant(message.into())
    }

    /// Whether redelivering the same message can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ScanError::UnknownDriver(_)
                | ScanError::InvalidArgument(_)
                | ScanError::Model(_)
                | ScanError::Url(_)
        )
    }
}

impl From<anyhow::Error> for ScanError {
    fn from(err: anyhow::Error) -> Self {
        ScanError::Driver(err)
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
