//! Error types for Strata Core

use crate::validation::ValidationError;
use thiserror::Error;

/// Result type alias using Strata's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Strata error types
///
/// Lookups (`get_entity`, `get_relation`) never produce `EntityNotFound` or
/// `RelationNotFound`; those variants are reserved for mutations that target
/// an id which does not exist in the caller's scope.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid tenant id {tenant_id:?}: {reason}")]
    InvalidTenantId { tenant_id: String, reason: String },

    #[error("Cross-tenant relation rejected: {relation_id} links tenant {source_tenant} to tenant {target_tenant}")]
    CrossTenantRelation {
        relation_id: String,
        source_tenant: String,
        target_tenant: String,
    },

    #[error("Tenant mismatch: record belongs to {found} but operation runs in {expected}")]
    TenantMismatch { expected: String, found: String },

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity already exists: {0}")]
    EntityExists(String),

    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    #[error("Relation already exists: {0}")]
    RelationExists(String),

    #[error("Entity {id} still has {count} dependent relation(s)")]
    DependentRelations { id: String, count: usize },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Backend connection error: {0}")]
    BackendConnection(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a cross-tenant error, rendering the global scope as `<global>`.
    pub fn cross_tenant(
        relation_id: impl Into<String>,
        source_tenant: Option<&str>,
        target_tenant: Option<&str>,
    ) -> Self {
        Self::CrossTenantRelation {
            relation_id: relation_id.into(),
            source_tenant: display_scope(source_tenant),
            target_tenant: display_scope(target_tenant),
        }
    }

    pub fn tenant_mismatch(expected: Option<&str>, found: Option<&str>) -> Self {
        Self::TenantMismatch {
            expected: display_scope(expected),
            found: display_scope(found),
        }
    }

    /// True for errors raised before any storage I/O was attempted.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidTenantId { .. }
                | Self::CrossTenantRelation { .. }
                | Self::TenantMismatch { .. }
                | Self::Validation(_)
        )
    }
}

pub(crate) fn display_scope(scope: Option<&str>) -> String {
    match scope {
        Some(tenant) if !tenant.is_empty() => tenant.to_string(),
        _ => "<global>".to_string(),
    }
}
