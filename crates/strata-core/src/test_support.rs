//! A minimal store implementing only the required primitives, so the
//! default graph operations can be tested in isolation.

use crate::entity::{Entity, EntityUpdate};
use crate::error::{Error, Result};
use crate::graph::{resolve_relation_endpoints, GraphStore};
use crate::query::GraphQuery;
use crate::relation::Relation;
use crate::tenant::{scope_of, TenantContext};
use crate::validation::{scope_entity, scope_relation, validate_entity};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
struct Rows {
    entities: Vec<(String, Entity)>,
    relations: Vec<(String, Relation)>,
}

#[derive(Default)]
pub struct FixtureStore {
    rows: Mutex<Rows>,
    owner_lookup: bool,
}

fn scope_key(ctx: Option<&TenantContext>) -> String {
    scope_of(ctx).unwrap_or_default().to_string()
}

impl FixtureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that answers `owning_tenant`
    pub fn with_owner_lookup() -> Self {
        Self {
            owner_lookup: true,
            ..Self::default()
        }
    }

    /// Global-scope graph with entities of type `Node` and relations given
    /// as `(source, target, type)`, inserted in order.
    pub async fn with_graph(nodes: &[&str], edges: &[(&str, &str, &str)]) -> Self {
        let store = Self::new();
        for node in nodes {
            store.add_entity(Entity::new(*node, "Node"), None).await.unwrap();
        }
        for (source, target, relation_type) in edges {
            let relation = Relation::new(*relation_type, *source, *target)
                .with_id(format!("{source}_{relation_type}_{target}"));
            store.add_relation(relation, None).await.unwrap();
        }
        store
    }
}

#[async_trait]
impl GraphStore for FixtureStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn add_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
        let entity = scope_entity(entity, ctx)?;
        let scope = scope_key(ctx);
        let mut rows = self.rows.lock().unwrap();
        if rows.entities.iter().any(|(s, e)| *s == scope && e.id == entity.id) {
            return Err(Error::EntityExists(entity.id));
        }
        rows.entities.push((scope, entity.clone()));
        Ok(entity)
    }

    async fn get_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<Option<Entity>> {
        let scope = scope_key(ctx);
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .entities
            .iter()
            .find(|(s, e)| *s == scope && e.id == id)
            .map(|(_, e)| e.clone()))
    }

    async fn update_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity> {
        let scope = scope_key(ctx);
        let mut rows = self.rows.lock().unwrap();
        let (_, entity) = rows
            .entities
            .iter_mut()
            .find(|(s, e)| *s == scope && e.id == id)
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        let mut updated = entity.clone();
        update.apply(&mut updated);
        validate_entity(&updated)?;
        *entity = updated.clone();
        Ok(updated)
    }

    async fn delete_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let scope = scope_key(ctx);
        let mut rows = self.rows.lock().unwrap();
        let before = rows.entities.len();
        rows.entities.retain(|(s, e)| !(*s == scope && e.id == id));
        if rows.entities.len() == before {
            return Err(Error::EntityNotFound(id.to_string()));
        }
        rows.relations.retain(|(s, r)| !(*s == scope && r.touches(id)));
        Ok(())
    }

    async fn add_relation(
        &self,
        relation: Relation,
        ctx: Option<&TenantContext>,
    ) -> Result<Relation> {
        let relation = scope_relation(relation, ctx)?;
        resolve_relation_endpoints(self, &relation, ctx).await?;
        let scope = scope_key(ctx);
        let mut rows = self.rows.lock().unwrap();
        if rows.relations.iter().any(|(s, r)| *s == scope && r.id == relation.id) {
            return Err(Error::RelationExists(relation.id));
        }
        rows.relations.push((scope, relation.clone()));
        Ok(relation)
    }

    async fn get_relation(
        &self,
        id: &str,
        ctx: Option<&TenantContext>,
    ) -> Result<Option<Relation>> {
        let scope = scope_key(ctx);
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .relations
            .iter()
            .find(|(s, r)| *s == scope && r.id == id)
            .map(|(_, r)| r.clone()))
    }

    async fn delete_relation(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let scope = scope_key(ctx);
        let mut rows = self.rows.lock().unwrap();
        let before = rows.relations.len();
        rows.relations.retain(|(s, r)| !(*s == scope && r.id == id));
        if rows.relations.len() == before {
            return Err(Error::RelationNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn query(&self, query: &GraphQuery, ctx: Option<&TenantContext>) -> Result<Vec<Entity>> {
        let scope = scope_key(ctx);
        let rows = self.rows.lock().unwrap();
        let in_scope = rows
            .entities
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, e)| e.clone());
        Ok(query.finish_entities(in_scope))
    }

    async fn query_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Relation>> {
        let scope = scope_key(ctx);
        let rows = self.rows.lock().unwrap();
        let in_scope = rows
            .relations
            .iter()
            .filter(|(s, _)| *s == scope)
            .map(|(_, r)| r.clone());
        Ok(query.finish_relations(in_scope))
    }

    async fn owning_tenant(&self, entity_id: &str) -> Result<Option<String>> {
        if !self.owner_lookup {
            return Ok(None);
        }
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .entities
            .iter()
            .find(|(s, e)| !s.is_empty() && e.id == entity_id)
            .map(|(s, _)| s.clone()))
    }
}
