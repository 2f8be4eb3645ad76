use std::{
    env, fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::error::ConfigLoadError;
use crate::models::{Backend, WorkerConfig};

const CANDIDATES: &[&str] = &[
    "catscan.toml",
    "catscan.json",
    "config/catscan.toml",
    "config/catscan.json",
];

/// Source that produced the worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// `--config` or `$CATSCAN_CONFIG_PATH`.
    Path(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Environment variables the loader consults.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,
    pub database_url: Option<String>,
    pub backend: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("CATSCAN_CONFIG_PATH").map(PathBuf::from),
            config_json: non_empty_var("CATSCAN_CONFIG_JSON"),
            database_url: non_empty_var("DATABASE_URL"),
            backend: non_empty_var("CATSCAN_BACKEND"),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Result of a load: the effective config and where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: WorkerConfig,
    pub source: ConfigSource,
    /// `.env` file that was applied, if any.
    pub env_file: Option<PathBuf>,
}

/// Resolves the worker configuration. Evaluation order:
/// 1) an explicit path, else `$CATSCAN_CONFIG_PATH` (TOML or JSON file),
/// 2) `$CATSCAN_CONFIG_JSON` (inline JSON),
/// 3) the first candidate file under the root directory,
/// 4) defaults.
///
/// `$DATABASE_URL` and `$CATSCAN_BACKEND` override whatever the source set.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
    env_file: Option<PathBuf>,
    config_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("."),
            env_file: None,
            config_path: None,
        }
    }

    /// Directory the candidate files are looked up in.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Loads this `.env` file instead of searching for one.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.env_file = Some(path.into());
        self
    }

    /// Reads this file instead of `$CATSCAN_CONFIG_PATH`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Applies `.env`, reads the process environment and resolves.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file = self.apply_env_file()?;
        let mut load = self.load_with(&EnvConfig::gather())?;
        load.env_file = env_file;
        Ok(load)
    }

    /// Resolves against an explicit environment snapshot.
    pub fn load_with(&self, env: &EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (mut config, source) = self.resolve(env)?;

        if let Some(url) = &env.database_url {
            config.database.url = Some(url.clone());
        }
        if let Some(raw) = &env.backend {
            config.backend = raw.parse::<Backend>()?;
        }
        config.validate()?;

        info!(
            source = ?source,
            backend = ?config.backend,
            "worker configuration loaded"
        );
        Ok(ConfigLoad {
            config,
            source,
            env_file: None,
        })
    }

    fn resolve(&self, env: &EnvConfig) -> Result<(WorkerConfig, ConfigSource), ConfigLoadError> {
        if let Some(path) = self.config_path.as_ref().or(env.config_path.as_ref()) {
            let config = load_from_file(path)?;
            return Ok((config, ConfigSource::Path(path.clone())));
        }

        if let Some(raw) = &env.config_json {
            let config = parse_json(raw, "CATSCAN_CONFIG_JSON")?;
            return Ok((config, ConfigSource::EnvInline));
        }

        if let Some(path) = self.find_default_file() {
            let config = load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((WorkerConfig::default(), ConfigSource::Default))
    }

    fn find_default_file(&self) -> Option<PathBuf> {
        CANDIDATES
            .iter()
            .map(|candidate| self.root.join(candidate))
            .find(|path| path.is_file())
    }

    fn apply_env_file(&self) -> Result<Option<PathBuf>, ConfigLoadError> {
        let result = match &self.env_file {
            Some(path) => dotenvy::from_path(path).map(|()| path.clone()),
            None => dotenvy::dotenv(),
        };
        match result {
            Ok(path) => {
                debug!(path = %path.display(), "applied .env file");
                Ok(Some(path))
            }
            Err(err) if err.not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

pub fn load_from_file(path: &Path) -> Result<WorkerConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents, &path.display().to_string()),
        Some("toml") | Some("tml") => {
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Toml {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => parse_from_str(&contents, &path.display().to_string()),
    }
}

/// Tries TOML first, then JSON.
pub fn parse_from_str(contents: &str, origin: &str) -> Result<WorkerConfig, ConfigLoadError> {
    toml::from_str(contents).or_else(|toml_err| {
        serde_json::from_str(contents).map_err(|json_err| ConfigLoadError::Unrecognized {
            origin: origin.to_string(),
            toml: toml_err.to_string(),
            json: json_err.to_string(),
        })
    })
}

fn parse_json(raw: &str, origin: &str) -> Result<WorkerConfig, ConfigLoadError> {
    serde_json::from_str(raw).map_err(|source| ConfigLoadError::Json {
        origin: origin.to_string(),
        source,
    })
}
