use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid JSON in {origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not parse {origin} as TOML ({toml}) or JSON ({json})")]
    Unrecognized {
        origin: String,
        toml: String,
        json: String,
    },

    #[error("failed to load .env file: {0}")]
    EnvFile(#[from] dotenvy::Error),

    #[error("unknown backend {0:?}; expected \"memory\" or \"postgres\"")]
    UnknownBackend(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
