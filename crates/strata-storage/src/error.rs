//! Storage error types

use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Storage-specific error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] ::rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] ::sqlx::Error),

    #[error(transparent)]
    Core(#[from] strata_core::Error),
}

impl StorageError {
    pub(crate) fn lock<E: std::fmt::Display>(e: E) -> Self {
        Self::Lock(e.to_string())
    }

    fn is_connectivity(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Io(_) => true,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(::rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ::rusqlite::ErrorCode::CannotOpen
                    | ::rusqlite::ErrorCode::NotADatabase
                    | ::rusqlite::ErrorCode::PermissionDenied
            ),
            #[cfg(feature = "postgres")]
            Self::Postgres(e) => matches!(
                e,
                ::sqlx::Error::Io(_)
                    | ::sqlx::Error::Tls(_)
                    | ::sqlx::Error::PoolTimedOut
                    | ::sqlx::Error::PoolClosed
                    | ::sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

impl From<StorageError> for strata_core::Error {
    fn from(err: StorageError) -> Self {
        if err.is_connectivity() {
            return strata_core::Error::BackendConnection(err.to_string());
        }
        match err {
            StorageError::Core(e) => e,
            StorageError::Serialization(e) => strata_core::Error::Serialization(e),
            other => strata_core::Error::Storage(other.to_string()),
        }
    }
}
