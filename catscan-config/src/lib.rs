//! Configuration loading for catscan workers.
//!
//! Resolves a [`WorkerConfig`] from an explicit file, inline JSON, a default
//! candidate file or built-in defaults, after loading `.env` so the usual
//! deployment variables are visible.

pub mod error;
pub mod loader;
pub mod models;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader, ConfigSource, EnvConfig};
pub use models::{Backend, DatabaseConfig, WorkerConfig};
