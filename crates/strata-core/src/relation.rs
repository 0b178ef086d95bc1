//! Relation (edge) types and operations

use crate::entity::{
    take_map, take_optional_f64, take_optional_string, take_string, take_timestamp,
    timestamp_value, Entity,
};
use crate::error::{Error, Result};
use crate::tenant::non_empty;
use crate::value::{FlatRecord, Properties, PropertyValue, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Direction for neighbor lookup and traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

/// A directed relation (edge) between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Identifier, unique within the tenant scope
    pub id: String,

    /// Type of relationship (e.g. "WORKS_FOR")
    pub relation_type: String,

    /// Source entity id
    pub source_id: String,

    /// Target entity id
    pub target_id: String,

    #[serde(default)]
    pub properties: Properties,

    #[serde(default)]
    pub metadata: Properties,

    /// Owning tenant; must match both endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Optional weight/strength of relationship
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Relation {
    /// Create a relation with a generated ULID id
    pub fn new(
        relation_type: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            relation_type: relation_type.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            properties: Properties::new(),
            metadata: Properties::new(),
            tenant_id: None,
            weight: None,
            created_at: Utc::now(),
        }
    }

    /// Create a relation between two loaded entities.
    ///
    /// Fails with `CrossTenantRelation` when the entities belong to different
    /// tenants; otherwise the relation inherits their tenant.
    pub fn between(
        relation_type: impl Into<String>,
        source: &Entity,
        target: &Entity,
    ) -> Result<Self> {
        let mut relation = Self::new(relation_type, source.id.clone(), target.id.clone());
        if source.tenant_scope() != target.tenant_scope() {
            return Err(Error::cross_tenant(
                relation.id,
                source.tenant_scope(),
                target.tenant_scope(),
            ));
        }
        relation.tenant_id = source.tenant_scope().map(str::to_string);
        Ok(relation)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the weight of this relation
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn tenant_scope(&self) -> Option<&str> {
        non_empty(self.tenant_id.as_deref())
    }

    /// True if the relation touches `entity_id` on either end
    pub fn touches(&self, entity_id: &str) -> bool {
        self.source_id == entity_id || self.target_id == entity_id
    }

    /// The entity reached from `from` by following this relation in
    /// `direction`, if the relation can be followed that way.
    pub fn follow(&self, from: &str, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Outgoing if self.source_id == from => Some(&self.target_id),
            Direction::Incoming if self.target_id == from => Some(&self.source_id),
            Direction::Both if self.source_id == from => Some(&self.target_id),
            Direction::Both if self.target_id == from => Some(&self.source_id),
            _ => None,
        }
    }
}

impl FlatRecord for Relation {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), self.id.clone().into());
        record.insert("relation_type".into(), self.relation_type.clone().into());
        record.insert("source_id".into(), self.source_id.clone().into());
        record.insert("target_id".into(), self.target_id.clone().into());
        record.insert("properties".into(), PropertyValue::Map(self.properties.clone()));
        record.insert("metadata".into(), PropertyValue::Map(self.metadata.clone()));
        if let Some(tenant) = &self.tenant_id {
            record.insert("tenant_id".into(), tenant.clone().into());
        }
        if let Some(weight) = self.weight {
            record.insert("weight".into(), PropertyValue::Float(weight));
        }
        record.insert("created_at".into(), timestamp_value(&self.created_at));
        record
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: take_string(&mut record, "id")?,
            relation_type: take_string(&mut record, "relation_type")?,
            source_id: take_string(&mut record, "source_id")?,
            target_id: take_string(&mut record, "target_id")?,
            properties: take_map(&mut record, "properties")?,
            metadata: take_map(&mut record, "metadata")?,
            tenant_id: take_optional_string(&mut record, "tenant_id")?,
            weight: take_optional_f64(&mut record, "weight")?,
            created_at: take_timestamp(&mut record, "created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_creation() {
        let relation = Relation::new("WORKS_FOR", "alice", "tech_corp").with_weight(0.8);

        assert_eq!(relation.source_id, "alice");
        assert_eq!(relation.target_id, "tech_corp");
        assert_eq!(relation.relation_type, "WORKS_FOR");
        assert_eq!(relation.weight, Some(0.8));
        assert!(relation.tenant_id.is_none());
    }

    #[test]
    fn test_between_same_tenant() {
        let alice = Entity::new("alice", "Person").with_tenant("acme");
        let corp = Entity::new("tech_corp", "Company").with_tenant("acme");

        let relation = Relation::between("WORKS_FOR", &alice, &corp).unwrap();
        assert_eq!(relation.tenant_scope(), Some("acme"));
    }

    #[test]
    fn test_between_rejects_cross_tenant() {
        let a = Entity::new("a", "Person").with_tenant("t1");
        let b = Entity::new("b", "Person").with_tenant("t2");

        let err = Relation::between("KNOWS", &a, &b).unwrap_err();
        assert!(matches!(err, Error::CrossTenantRelation { .. }));
    }

    #[test]
    fn test_follow() {
        let relation = Relation::new("KNOWS", "a", "b");
        assert_eq!(relation.follow("a", Direction::Outgoing), Some("b"));
        assert_eq!(relation.follow("b", Direction::Outgoing), None);
        assert_eq!(relation.follow("b", Direction::Incoming), Some("a"));
        assert_eq!(relation.follow("b", Direction::Both), Some("a"));
        assert_eq!(relation.follow("c", Direction::Both), None);
    }

    #[test]
    fn test_record_round_trip() {
        let relation = Relation::new("WORKS_FOR", "alice", "tech_corp")
            .with_tenant("acme")
            .with_property("since", 2019)
            .with_weight(0.5);
        let back = Relation::from_record(relation.to_record()).unwrap();
        assert_eq!(back, relation);
    }
}
