//! Payload validation and tenant scoping rules
//!
//! Everything here runs before a backend touches storage, so a rejected
//! write never leaves partial state behind.

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::relation::Relation;
use crate::tenant::{non_empty, scope_of, TenantContext};
use crate::value::Properties;

/// Maximum length for entity and relation ids (512 chars)
pub const MAX_ID_LEN: usize = 512;

/// Maximum length for entity and relation type tags (128 chars)
pub const MAX_TYPE_LEN: usize = 128;

/// Maximum length for a property key (256 chars)
pub const MAX_PROPERTY_KEY_LEN: usize = 256;

/// Maximum traversal depth accepted by the traversal engine (16)
pub const MAX_TRAVERSAL_DEPTH: u32 = 16;

/// Depth callers are advised to stay under for interactive workloads
pub const RECOMMENDED_MAX_DEPTH: u32 = 3;

/// Validation error type
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyId,
    IdTooLong { len: usize, max: usize },
    IdHasControlChars(String),
    EmptyType,
    TypeTooLong { len: usize, max: usize },
    EmptyPropertyKey,
    PropertyKeyTooLong { len: usize, max: usize },
    NonFiniteValue { key: String },
    NonFiniteEmbedding,
    EmptyEmbedding,
    NonFiniteWeight,
    TraversalDepthTooLarge { depth: u32, max: u32 },
    MalformedRecord { field: String, reason: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "Id cannot be empty"),
            Self::IdTooLong { len, max } => write!(f, "Id too long: {} chars (max {})", len, max),
            Self::IdHasControlChars(id) => write!(f, "Id contains control characters: {:?}", id),
            Self::EmptyType => write!(f, "Type tag cannot be empty"),
            Self::TypeTooLong { len, max } => {
                write!(f, "Type tag too long: {} chars (max {})", len, max)
            }
            Self::EmptyPropertyKey => write!(f, "Property key cannot be empty"),
            Self::PropertyKeyTooLong { len, max } => {
                write!(f, "Property key too long: {} chars (max {})", len, max)
            }
            Self::NonFiniteValue { key } => write!(f, "Property {} holds a non-finite float", key),
            Self::NonFiniteEmbedding => write!(f, "Embedding contains non-finite components"),
            Self::EmptyEmbedding => write!(f, "Embedding cannot be empty"),
            Self::NonFiniteWeight => write!(f, "Relation weight must be finite"),
            Self::TraversalDepthTooLarge { depth, max } => {
                write!(f, "Traversal depth too large: {} (max {})", depth, max)
            }
            Self::MalformedRecord { field, reason } => {
                write!(f, "Malformed record field {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate an entity or relation id
pub fn validate_id(id: &str) -> std::result::Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if id.len() > MAX_ID_LEN {
        return Err(ValidationError::IdTooLong {
            len: id.len(),
            max: MAX_ID_LEN,
        });
    }
    if id.chars().any(char::is_control) {
        return Err(ValidationError::IdHasControlChars(id.chars().take(64).collect()));
    }
    Ok(())
}

/// Validate an entity or relation type tag
pub fn validate_type(tag: &str) -> std::result::Result<(), ValidationError> {
    if tag.trim().is_empty() {
        return Err(ValidationError::EmptyType);
    }
    if tag.len() > MAX_TYPE_LEN {
        return Err(ValidationError::TypeTooLong {
            len: tag.len(),
            max: MAX_TYPE_LEN,
        });
    }
    Ok(())
}

/// Validate property keys and reject non-finite floats
pub fn validate_properties(properties: &Properties) -> std::result::Result<(), ValidationError> {
    for (key, value) in properties {
        if key.is_empty() {
            return Err(ValidationError::EmptyPropertyKey);
        }
        if key.len() > MAX_PROPERTY_KEY_LEN {
            return Err(ValidationError::PropertyKeyTooLong {
                len: key.len(),
                max: MAX_PROPERTY_KEY_LEN,
            });
        }
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue { key: key.clone() });
        }
    }
    Ok(())
}

pub fn validate_embedding(embedding: &[f32]) -> std::result::Result<(), ValidationError> {
    if embedding.is_empty() {
        return Err(ValidationError::EmptyEmbedding);
    }
    if embedding.iter().any(|x| !x.is_finite()) {
        return Err(ValidationError::NonFiniteEmbedding);
    }
    Ok(())
}

/// Validate an entity payload
pub fn validate_entity(entity: &Entity) -> std::result::Result<(), ValidationError> {
    validate_id(&entity.id)?;
    validate_type(&entity.entity_type)?;
    validate_properties(&entity.properties)?;
    validate_properties(&entity.metadata)?;
    if let Some(embedding) = &entity.embedding {
        validate_embedding(embedding)?;
    }
    Ok(())
}

/// Validate a relation payload (ids, type, properties, weight)
pub fn validate_relation_payload(relation: &Relation) -> std::result::Result<(), ValidationError> {
    validate_id(&relation.id)?;
    validate_id(&relation.source_id)?;
    validate_id(&relation.target_id)?;
    validate_type(&relation.relation_type)?;
    validate_properties(&relation.properties)?;
    validate_properties(&relation.metadata)?;
    if relation.weight.is_some_and(|w| !w.is_finite()) {
        return Err(ValidationError::NonFiniteWeight);
    }
    Ok(())
}

/// Validate traversal depth
pub fn validate_traversal_depth(depth: u32) -> std::result::Result<(), ValidationError> {
    if depth > MAX_TRAVERSAL_DEPTH {
        return Err(ValidationError::TraversalDepthTooLarge {
            depth,
            max: MAX_TRAVERSAL_DEPTH,
        });
    }
    Ok(())
}

/// Check that a relation and its two endpoints share one tenant.
///
/// Runs in every isolation mode; with isolation disabled all tenants are
/// empty and the check passes trivially.
pub fn validate_relation(relation: &Relation, source: &Entity, target: &Entity) -> Result<()> {
    let relation_tenant = relation.tenant_scope();
    if source.tenant_scope() != target.tenant_scope() {
        return Err(Error::cross_tenant(
            relation.id.clone(),
            source.tenant_scope(),
            target.tenant_scope(),
        ));
    }
    if source.tenant_scope() != relation_tenant {
        return Err(Error::cross_tenant(
            relation.id.clone(),
            relation_tenant,
            source.tenant_scope(),
        ));
    }
    Ok(())
}

/// Bind an incoming entity to the context's scope.
///
/// An entity without a tenant adopts the context tenant; one that names a
/// different tenant is rejected.
pub fn scope_entity(mut entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
    let scope = scope_of(ctx);
    match (non_empty(entity.tenant_id.as_deref()), scope) {
        (None, _) => entity.tenant_id = scope.map(str::to_string),
        (Some(found), Some(expected)) if found.eq_ignore_ascii_case(expected) => {
            entity.tenant_id = Some(expected.to_string());
        }
        (found, expected) => return Err(Error::tenant_mismatch(expected, found)),
    }
    validate_entity(&entity)?;
    Ok(entity)
}

/// Bind an incoming relation to the context's scope.
///
/// A relation naming another tenant than the context is a cross-tenant
/// attempt and is rejected unconditionally.
pub fn scope_relation(mut relation: Relation, ctx: Option<&TenantContext>) -> Result<Relation> {
    let scope = scope_of(ctx);
    match (non_empty(relation.tenant_id.as_deref()), scope) {
        (None, _) => relation.tenant_id = scope.map(str::to_string),
        (Some(found), Some(expected)) if found.eq_ignore_ascii_case(expected) => {
            relation.tenant_id = Some(expected.to_string());
        }
        (found, expected) => {
            return Err(Error::cross_tenant(relation.id.clone(), found, expected));
        }
    }
    validate_relation_payload(&relation)?;
    Ok(relation)
}
