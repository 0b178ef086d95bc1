//! Declarative graph queries
//!
//! A [`GraphQuery`] carries no tenant information. Scoping is always applied
//! by the store from the `TenantContext` passed alongside the query.

use crate::entity::Entity;
use crate::relation::Relation;
use crate::value::{Properties, PropertyValue};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A predicate over one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum PropertyPredicate {
    Equals { key: String, value: PropertyValue },
    NotEquals { key: String, value: PropertyValue },
    Exists { key: String },
    GreaterThan { key: String, value: PropertyValue },
    LessThan { key: String, value: PropertyValue },
    Contains { key: String, value: PropertyValue },
}

impl PropertyPredicate {
    pub fn key(&self) -> &str {
        match self {
            Self::Equals { key, .. }
            | Self::NotEquals { key, .. }
            | Self::Exists { key }
            | Self::GreaterThan { key, .. }
            | Self::LessThan { key, .. }
            | Self::Contains { key, .. } => key,
        }
    }

    /// Evaluate against a property map. A missing key only satisfies
    /// `NotEquals`.
    pub fn matches(&self, properties: &Properties) -> bool {
        let actual = properties.get(self.key());
        match (self, actual) {
            (Self::Exists { .. }, found) => found.is_some(),
            (Self::NotEquals { value, .. }, found) => found != Some(value),
            (_, None) => false,
            (Self::Equals { value, .. }, Some(found)) => found == value,
            (Self::GreaterThan { value, .. }, Some(found)) => {
                found.compare(value) == Some(Ordering::Greater)
            }
            (Self::LessThan { value, .. }, Some(found)) => {
                found.compare(value) == Some(Ordering::Less)
            }
            (Self::Contains { value, .. }, Some(found)) => found.contains(value),
        }
    }
}

/// Query builder for entities and relations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQuery {
    /// Filter entities by type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Filter relations by type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<String>,

    /// Property predicates (all must hold)
    #[serde(default)]
    pub predicates: Vec<PropertyPredicate>,

    /// Only relations leaving this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    /// Only relations entering this entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    /// Maximum number of results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl GraphQuery {
    /// Match everything in scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Entities of one type
    pub fn entities_of_type(entity_type: impl Into<String>) -> Self {
        Self::new().with_entity_type(entity_type)
    }

    /// Relations of one type
    pub fn relations_of_type(relation_type: impl Into<String>) -> Self {
        Self::new().with_relation_type(relation_type)
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_relation_type(mut self, relation_type: impl Into<String>) -> Self {
        self.relation_type = Some(relation_type.into());
        self
    }

    pub fn with_predicate(mut self, predicate: PropertyPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn where_eq(self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.with_predicate(PropertyPredicate::Equals {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_ne(self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.with_predicate(PropertyPredicate::NotEquals {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_exists(self, key: impl Into<String>) -> Self {
        self.with_predicate(PropertyPredicate::Exists { key: key.into() })
    }

    pub fn where_gt(self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.with_predicate(PropertyPredicate::GreaterThan {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_lt(self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.with_predicate(PropertyPredicate::LessThan {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn where_contains(self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.with_predicate(PropertyPredicate::Contains {
            key: key.into(),
            value: value.into(),
        })
    }

    /// Restrict relations to those leaving `entity_id`
    pub fn from_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.source_id = Some(entity_id.into());
        self
    }

    /// Restrict relations to those entering `entity_id`
    pub fn to_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.target_id = Some(entity_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn has_predicates(&self) -> bool {
        !self.predicates.is_empty()
    }

    /// Entity match on type and predicates (anchors are ignored)
    pub fn matches_entity(&self, entity: &Entity) -> bool {
        if let Some(entity_type) = &self.entity_type {
            if &entity.entity_type != entity_type {
                return false;
            }
        }
        self.predicates.iter().all(|p| p.matches(&entity.properties))
    }

    /// Relation match on type, anchors and predicates
    pub fn matches_relation(&self, relation: &Relation) -> bool {
        if let Some(relation_type) = &self.relation_type {
            if &relation.relation_type != relation_type {
                return false;
            }
        }
        if let Some(source) = &self.source_id {
            if &relation.source_id != source {
                return false;
            }
        }
        if let Some(target) = &self.target_id {
            if &relation.target_id != target {
                return false;
            }
        }
        self.predicates.iter().all(|p| p.matches(&relation.properties))
    }

    /// Apply predicates and limit to rows a backend already narrowed by
    /// its own indexes
    pub fn finish_entities(&self, entities: impl IntoIterator<Item = Entity>) -> Vec<Entity> {
        let matching = entities.into_iter().filter(|e| self.matches_entity(e));
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn finish_relations(&self, relations: impl IntoIterator<Item = Relation>) -> Vec<Relation> {
        let matching = relations.into_iter().filter(|r| self.matches_relation(r));
        match self.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}
