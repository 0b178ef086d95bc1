//! Strata Storage - Tenant-isolated backends for the graph store
//!
//! This crate provides the in-memory, SQLite and (behind the `postgres`
//! feature) PostgreSQL implementations of [`strata_core::GraphStore`], the
//! configuration that selects between them, and the metrics sink they
//! report to.

#![allow(clippy::result_large_err)]

pub mod backend;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod migration;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use backend::GraphBackend;
pub use config::{
    BackendConfig, CascadePolicy, MemoryConfig, PostgresConfig, SqliteConfig, StorageConfig,
    DEFAULT_MAX_TENANT_GRAPHS,
};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryGraphStore;
pub use metrics::{NoopMetrics, RecorderMetrics, SharedMetrics, StoreMetrics};
pub use migration::{Migratable, SchemaVersion, CURRENT_VERSION};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteGraphStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresGraphStore;
