use std::str::FromStr;

use catscan_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigLoadError;

/// Where scan state, queue and leases live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Single process; everything is lost on exit.
    #[default]
    Memory,
    Postgres,
}

impl FromStr for Backend {
    type Err = ConfigLoadError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Backend::Memory),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            _ => Err(ConfigLoadError::UnknownBackend(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Everything a worker process needs to start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub backend: Backend,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.backend == Backend::Postgres
            && self
                .database
                .url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty())
        {
            return Err(ConfigLoadError::Invalid(
                "the postgres backend needs database.url or DATABASE_URL".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigLoadError::Invalid(
                "database.max_connections must be at least 1".to_string(),
            ));
        }

        let engine = &self.engine;
        if engine.retry.max_attempts == 0 {
            return Err(ConfigLoadError::Invalid(
                "engine.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&engine.retry.jitter_ratio) {
            return Err(ConfigLoadError::Invalid(format!(
                "engine.retry.jitter_ratio must be within [0, 1], got {}",
                engine.retry.jitter_ratio
            )));
        }
        if engine.queue.worker_count == 0 || engine.queue.batch_size == 0 {
            return Err(ConfigLoadError::Invalid(
                "engine.queue.worker_count and batch_size must be at least 1".to_string(),
            ));
        }
        if engine.lease.renew_interval() >= engine.lease.ttl().to_std().unwrap_or_default() {
            return Err(ConfigLoadError::Invalid(
                "engine.lease renewal must happen before the lease expires".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parses_common_spellings() {
        assert_eq!("Postgres".parse::<Backend>().unwrap(), Backend::Postgres);
        assert_eq!("postgresql".parse::<Backend>().unwrap(), Backend::Postgres);
        assert_eq!(" memory ".parse::<Backend>().unwrap(), Backend::Memory);
        assert!(matches!(
            "redis".parse::<Backend>(),
            Err(ConfigLoadError::UnknownBackend(_))
        ));
    }

    #[test]
    fn defaults_are_valid() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn postgres_without_url_is_rejected() {
        let mut config = WorkerConfig {
            backend: Backend::Postgres,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());

        config.database.url = Some("postgres://localhost/catscan".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn out_of_range_jitter_is_rejected() {
        let mut config = WorkerConfig::default();
        config.engine.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
    }
}
