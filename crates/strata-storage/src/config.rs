//! Backend configuration
//!
//! ```toml
//! cascade = "reject"
//!
//! [backend]
//! kind = "sqlite"
//! path = "/var/lib/strata"
//! isolation_mode = "separate_schema"
//! ```

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strata_core::IsolationMode;

/// Default bound on live tenant graphs held by the in-memory backend
pub const DEFAULT_MAX_TENANT_GRAPHS: usize = 100;

/// What `delete_entity` does with relations still referencing the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Remove dependent relations in the same write
    #[default]
    Cascade,
    /// Refuse the delete while relations reference the entity
    Reject,
}

/// Top-level storage configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub cascade: CascadePolicy,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Backend selection and its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Memory(MemoryConfig),
    Sqlite(SqliteConfig),
    Postgres(PostgresConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory(MemoryConfig::default())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_tenant_graphs")]
    pub max_tenant_graphs: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_tenant_graphs: DEFAULT_MAX_TENANT_GRAPHS,
        }
    }
}

fn default_max_tenant_graphs() -> usize {
    DEFAULT_MAX_TENANT_GRAPHS
}

/// Embedded-file backend settings.
///
/// With `shared_schema` (or `disabled`) `path` names the database file; with
/// `separate_schema` it names the directory holding one file per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    pub path: PathBuf,

    #[serde(default)]
    pub isolation_mode: IsolationMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,

    #[serde(default)]
    pub isolation_mode: IsolationMode,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Install row-level security policies in shared-schema mode
    #[serde(default = "default_enable_rls")]
    pub enable_rls: bool,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_min_connections() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    10
}

fn default_enable_rls() -> bool {
    true
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            isolation_mode: IsolationMode::default(),
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            enable_rls: default_enable_rls(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl StorageConfig {
    pub fn memory(max_tenant_graphs: usize) -> Self {
        Self {
            cascade: CascadePolicy::default(),
            backend: BackendConfig::Memory(MemoryConfig { max_tenant_graphs }),
        }
    }

    pub fn sqlite(path: impl Into<PathBuf>, isolation_mode: IsolationMode) -> Self {
        Self {
            cascade: CascadePolicy::default(),
            backend: BackendConfig::Sqlite(SqliteConfig {
                path: path.into(),
                isolation_mode,
            }),
        }
    }

    pub fn postgres(config: PostgresConfig) -> Self {
        Self {
            cascade: CascadePolicy::default(),
            backend: BackendConfig::Postgres(config),
        }
    }

    pub fn with_cascade(mut self, cascade: CascadePolicy) -> Self {
        self.cascade = cascade;
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> StorageResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| StorageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded storage configuration");
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> StorageResult<()> {
        match &self.backend {
            BackendConfig::Memory(memory) if memory.max_tenant_graphs == 0 => Err(
                StorageError::Config("max_tenant_graphs must be at least 1".into()),
            ),
            BackendConfig::Sqlite(sqlite) if sqlite.path.as_os_str().is_empty() => {
                Err(StorageError::Config("sqlite path cannot be empty".into()))
            }
            BackendConfig::Postgres(pg) if pg.url.is_empty() => {
                Err(StorageError::Config("postgres url cannot be empty".into()))
            }
            BackendConfig::Postgres(pg) if pg.max_connections == 0 => Err(StorageError::Config(
                "max_connections must be at least 1".into(),
            )),
            BackendConfig::Postgres(pg) if pg.min_connections > pg.max_connections => {
                Err(StorageError::Config(format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    pg.min_connections, pg.max_connections
                )))
            }
            _ => Ok(()),
        }
    }
}
