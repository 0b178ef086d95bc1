//! Strata Core - Tenant-aware graph model and store contract
//!
//! This crate provides the data types, tenant isolation rules, validation
//! and the [`GraphStore`] trait shared by every Strata storage backend, plus
//! the generic traversal engine the trait's default operations run on.

pub mod entity;
pub mod error;
pub mod graph;
pub mod query;
pub mod relation;
pub mod tenant;
pub mod traversal;
pub mod validation;
pub mod value;
pub mod vector;

#[cfg(test)]
mod test_support;

pub use entity::{Entity, EntityUpdate};
pub use error::{Error, Result};
pub use graph::{classify_missing_endpoint, resolve_relation_endpoints, GraphStore};
pub use query::{GraphQuery, PropertyPredicate};
pub use relation::{Direction, Relation};
pub use tenant::{IsolationMode, TenantContext};
pub use traversal::{Path, TraversalEngine, TraversalOptions, TraversalStats};
pub use validation::{ValidationError, MAX_TRAVERSAL_DEPTH, RECOMMENDED_MAX_DEPTH};
pub use value::{FlatRecord, Properties, PropertyValue, Record};
pub use vector::{VectorMatch, FALLBACK_SIMILARITY};
