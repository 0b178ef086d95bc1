//! Entity (node) types and operations

use crate::error::{Error, Result};
use crate::tenant::non_empty;
use crate::value::{FlatRecord, Properties, PropertyValue, Record};
use crate::validation::ValidationError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// An entity in the graph (a node)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier, unique within the tenant scope
    pub id: String,

    /// Entity type tag (e.g. "Person", "Company")
    pub entity_type: String,

    /// Business properties (open schema)
    #[serde(default)]
    pub properties: Properties,

    /// Provenance/confidence metadata
    #[serde(default)]
    pub metadata: Properties,

    /// Owning tenant; `None` is the global scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Opaque vector embedding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create a new entity with a caller-chosen id
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            properties: Properties::new(),
            metadata: Properties::new(),
            tenant_id: None,
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new entity with a generated ULID id
    pub fn generated(entity_type: impl Into<String>) -> Self {
        Self::new(Ulid::new().to_string(), entity_type)
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

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Owning tenant with the empty string folded into `None`
    pub fn tenant_scope(&self) -> Option<&str> {
        non_empty(self.tenant_id.as_deref())
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}

/// A change applied by `update_entity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum EntityUpdate {
    /// Replace the whole property map
    Replace(Properties),
    /// Overwrite the given keys, keep the rest
    Merge(Properties),
    /// Remove the given keys
    Remove(Vec<String>),
    /// Set or clear the embedding
    Embedding(Option<Vec<f32>>),
}

impl EntityUpdate {
    /// Apply the update in place and bump `updated_at`
    pub fn apply(&self, entity: &mut Entity) {
        match self {
            Self::Replace(properties) => entity.properties = properties.clone(),
            Self::Merge(properties) => {
                for (key, value) in properties {
                    entity.properties.insert(key.clone(), value.clone());
                }
            }
            Self::Remove(keys) => {
                for key in keys {
                    entity.properties.remove(key);
                }
            }
            Self::Embedding(embedding) => entity.embedding = embedding.clone(),
        }
        entity.updated_at = Utc::now();
    }
}

impl FlatRecord for Entity {
    fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), self.id.clone().into());
        record.insert("entity_type".into(), self.entity_type.clone().into());
        record.insert("properties".into(), PropertyValue::Map(self.properties.clone()));
        record.insert("metadata".into(), PropertyValue::Map(self.metadata.clone()));
        if let Some(tenant) = &self.tenant_id {
            record.insert("tenant_id".into(), tenant.clone().into());
        }
        if let Some(embedding) = &self.embedding {
            record.insert(
                "embedding".into(),
                PropertyValue::List(
                    embedding
                        .iter()
                        .map(|x| PropertyValue::Float(f64::from(*x)))
                        .collect(),
                ),
            );
        }
        record.insert("created_at".into(), timestamp_value(&self.created_at));
        record.insert("updated_at".into(), timestamp_value(&self.updated_at));
        record
    }

    fn from_record(mut record: Record) -> Result<Self> {
        Ok(Self {
            id: take_string(&mut record, "id")?,
            entity_type: take_string(&mut record, "entity_type")?,
            properties: take_map(&mut record, "properties")?,
            metadata: take_map(&mut record, "metadata")?,
            tenant_id: take_optional_string(&mut record, "tenant_id")?,
            embedding: take_embedding(&mut record, "embedding")?,
            created_at: take_timestamp(&mut record, "created_at")?,
            updated_at: take_timestamp(&mut record, "updated_at")?,
        })
    }
}

pub(crate) fn timestamp_value(ts: &DateTime<Utc>) -> PropertyValue {
    PropertyValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn malformed(field: &str, reason: &str) -> Error {
    Error::Validation(ValidationError::MalformedRecord {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

pub(crate) fn take_string(record: &mut Record, field: &str) -> Result<String> {
    match record.remove(field) {
        Some(PropertyValue::String(s)) => Ok(s),
        Some(other) => Err(malformed(field, &format!("expected string, got {}", other.kind()))),
        None => Err(malformed(field, "missing")),
    }
}

pub(crate) fn take_optional_string(record: &mut Record, field: &str) -> Result<Option<String>> {
    match record.remove(field) {
        Some(PropertyValue::String(s)) => Ok(Some(s)),
        Some(other) => Err(malformed(field, &format!("expected string, got {}", other.kind()))),
        None => Ok(None),
    }
}

pub(crate) fn take_map(record: &mut Record, field: &str) -> Result<Properties> {
    match record.remove(field) {
        Some(PropertyValue::Map(map)) => Ok(map),
        Some(other) => Err(malformed(field, &format!("expected map, got {}", other.kind()))),
        None => Ok(Properties::new()),
    }
}

pub(crate) fn take_optional_f64(record: &mut Record, field: &str) -> Result<Option<f64>> {
    match record.remove(field) {
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| malformed(field, &format!("expected number, got {}", value.kind()))),
        None => Ok(None),
    }
}

fn take_embedding(record: &mut Record, field: &str) -> Result<Option<Vec<f32>>> {
    match record.remove(field) {
        Some(PropertyValue::List(items)) => items
            .iter()
            .map(|item| {
                item.as_f64()
                    .map(|x| x as f32)
                    .ok_or_else(|| malformed(field, "embedding components must be numbers"))
            })
            .collect::<Result<Vec<f32>>>()
            .map(Some),
        Some(other) => Err(malformed(field, &format!("expected list, got {}", other.kind()))),
        None => Ok(None),
    }
}

pub(crate) fn take_timestamp(record: &mut Record, field: &str) -> Result<DateTime<Utc>> {
    let raw = take_string(record, field)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| malformed(field, &e.to_string()))
}
