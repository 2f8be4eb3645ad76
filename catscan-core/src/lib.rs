//! # catscan-core
//!
//! Catalog scan engine. Turns a time window of the package catalog into
//! index, page and leaf units of work, drives registered drivers over them
//! through an at-least-once queue, and advances per-driver cursors once a
//! window is fully processed.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres-backed entity store, work queue and leases (SQLx)
//!
//! ## Architecture
//!
//! - [`storage`]: partitioned entity store with optimistic concurrency
//! - [`queue`]: work queue with delayed visibility and a poison queue
//! - [`lease`]: named, auto-renewing start leases
//! - [`catalog`]: catalog feed client
//! - [`driver`]: driver contracts and registry
//! - [`orchestration`]: index, page and leaf processors
//! - [`cursor`]: cursor and dependency service
//! - [`worker`]: queue-driven worker runtime

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod catalog;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod driver;
pub mod engine;
pub mod error;
pub mod lease;
pub mod orchestration;
pub mod queue;
pub mod storage;
pub mod worker;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use catalog::{CatalogSource, HttpCatalogClient, InMemoryCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use cursor::{CursorService, CursorStatus, DependencySource, StartOutcome};
pub use driver::{
    BatchItemOutcome, BatchLeafDriver, CatalogScanDriver, DriverRegistry, LeafDriver,
    LeafOutcome, PageScanResult, RegisteredDriver,
};
pub use engine::{EngineComponents, ScanEngine};
pub use error::{Result, ScanError};
pub use worker::{DispatchStatus, ScanWorker, spawn_worker_pool};
