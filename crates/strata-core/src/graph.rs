//! The two-tier graph store contract
//!
//! Tier 1 is the small set of primitives every backend must provide. Tier 2
//! operations ship with default implementations composed from Tier 1, so a
//! new backend works as soon as the primitives exist; backends with native
//! indexes override the Tier-2 methods they can do faster.

use crate::entity::{Entity, EntityUpdate};
use crate::error::{Error, Result};
use crate::query::GraphQuery;
use crate::relation::{Direction, Relation};
use crate::tenant::{scope_of, TenantContext};
use crate::traversal::{Path, TraversalEngine, TraversalOptions};
use crate::validation::validate_relation;
use crate::vector::{fallback_matches, VectorMatch};
use async_trait::async_trait;
use std::collections::HashSet;

/// Main trait for tenant-scoped graph storage
///
/// Every entity and relation call takes an optional [`TenantContext`];
/// `None` behaves exactly like [`TenantContext::disabled`].
#[async_trait]
pub trait GraphStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Prepare the store (create tables, open pools, ...)
    async fn initialize(&self) -> Result<()>;

    /// Release connections and handles
    async fn close(&self) -> Result<()>;

    /// Cheap liveness check
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a new entity; the stored copy is returned.
    ///
    /// Fails with `EntityExists` if the id is taken in the scope.
    async fn add_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity>;

    /// Look up an entity. Unknown ids yield `None`.
    async fn get_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<Option<Entity>>;

    /// Apply an update and return the new state
    async fn update_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity>;

    /// Delete an entity, applying the store's cascade policy
    async fn delete_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Relation Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a new relation between two existing entities of the same scope
    async fn add_relation(
        &self,
        relation: Relation,
        ctx: Option<&TenantContext>,
    ) -> Result<Relation>;

    /// Look up a relation. Unknown ids yield `None`.
    async fn get_relation(&self, id: &str, ctx: Option<&TenantContext>)
        -> Result<Option<Relation>>;

    async fn delete_relation(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Entities in scope matching the query
    async fn query(&self, query: &GraphQuery, ctx: Option<&TenantContext>) -> Result<Vec<Entity>>;

    /// Relations in scope matching the query
    async fn query_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Relation>>;

    /// Tenant that owns an entity with this id, if any non-global tenant does.
    ///
    /// Used only to classify failed relation writes; it never exposes entity
    /// data. The default cannot see other scopes and reports `None`.
    async fn owning_tenant(&self, _entity_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Relations adjacent to `entity_id` paired with the entity on the far end.
    ///
    /// Relations whose far end does not resolve in the same scope are
    /// skipped.
    async fn get_neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<(Relation, Entity)>> {
        let query = match direction {
            Direction::Outgoing => GraphQuery::new().from_entity(entity_id),
            Direction::Incoming => GraphQuery::new().to_entity(entity_id),
            Direction::Both => GraphQuery::new(),
        };

        let mut edges = Vec::new();
        for relation in self.query_relations(&query, ctx).await? {
            if !relation_types.is_empty() && !relation_types.contains(&relation.relation_type) {
                continue;
            }
            let Some(other) = relation.follow(entity_id, direction).map(str::to_string) else {
                continue;
            };
            if let Some(entity) = self.get_entity(&other, ctx).await? {
                edges.push((relation, entity));
            }
        }
        Ok(edges)
    }

    /// Distinct entities one hop away
    async fn get_neighbors(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Entity>> {
        let edges = self
            .get_neighbor_edges(entity_id, direction, relation_types, ctx)
            .await?;
        let mut seen = HashSet::new();
        Ok(edges
            .into_iter()
            .filter_map(|(_, entity)| seen.insert(entity.id.clone()).then_some(entity))
            .collect())
    }

    /// All outgoing paths of length `1..=max_depth` from `start_id`
    async fn traverse(
        &self,
        start_id: &str,
        max_depth: u32,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Path>> {
        let options = TraversalOptions::new(start_id).with_max_depth(max_depth);
        self.traverse_with(&options, ctx).await
    }

    /// Traversal with direction, type filters and a path cap
    async fn traverse_with(
        &self,
        options: &TraversalOptions,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Path>> {
        TraversalEngine::execute(self, options, ctx).await
    }

    /// Outgoing paths from `start_id` that end at `end_id`
    async fn find_paths(
        &self,
        start_id: &str,
        end_id: &str,
        max_depth: u32,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Path>> {
        if start_id == end_id {
            return Ok(Vec::new());
        }
        let options = TraversalOptions::new(start_id)
            .find_path_to(end_id)
            .with_max_depth(max_depth);
        self.traverse_with(&options, ctx).await
    }

    /// Entities ranked by similarity to `embedding`.
    ///
    /// Without a native index every entity carrying an embedding is returned
    /// with [`crate::vector::FALLBACK_SIMILARITY`].
    async fn vector_search(
        &self,
        _embedding: &[f32],
        max_results: usize,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<VectorMatch>> {
        let entities = self.query(&GraphQuery::new(), ctx).await?;
        Ok(fallback_matches(entities, max_results))
    }

    async fn count_entities(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        Ok(self.query(&GraphQuery::new(), ctx).await?.len())
    }

    async fn count_relations(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        Ok(self.query_relations(&GraphQuery::new(), ctx).await?.len())
    }
}

/// Load both endpoints of a relation from the context scope and check that
/// they share the relation's tenant.
///
/// Backends call this from `add_relation` after scoping the relation with
/// [`crate::validation::scope_relation`].
pub async fn resolve_relation_endpoints<S>(
    store: &S,
    relation: &Relation,
    ctx: Option<&TenantContext>,
) -> Result<(Entity, Entity)>
where
    S: GraphStore + ?Sized,
{
    let Some(source) = store.get_entity(&relation.source_id, ctx).await? else {
        return Err(classify_missing_endpoint(store, &relation.source_id, relation, ctx).await);
    };
    let Some(target) = store.get_entity(&relation.target_id, ctx).await? else {
        return Err(classify_missing_endpoint(store, &relation.target_id, relation, ctx).await);
    };
    validate_relation(relation, &source, &target)?;
    Ok((source, target))
}

/// Decide why a relation endpoint could not be found in the caller's scope.
///
/// An endpoint owned by another tenant makes the write a cross-tenant
/// attempt; anything else is a plain missing entity. A failing lookup falls
/// back to `EntityNotFound`.
pub async fn classify_missing_endpoint<S>(
    store: &S,
    missing_id: &str,
    relation: &Relation,
    ctx: Option<&TenantContext>,
) -> Error
where
    S: GraphStore + ?Sized,
{
    let scope = scope_of(ctx);
    match store.owning_tenant(missing_id).await {
        Ok(Some(owner)) if Some(owner.as_str()) != scope => {
            tracing::warn!(
                relation = %relation.id,
                endpoint = %missing_id,
                "Rejected relation to an entity of another tenant"
            );
            Error::cross_tenant(relation.id.clone(), scope, Some(owner.as_str()))
        }
        Ok(_) => Error::EntityNotFound(missing_id.to_string()),
        Err(e) => {
            tracing::debug!(endpoint = %missing_id, error = %e, "Owner lookup failed");
            Error::EntityNotFound(missing_id.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FixtureStore;
    use crate::vector::FALLBACK_SIMILARITY;

    fn acme() -> TenantContext {
        TenantContext::shared("acme").unwrap()
    }

    async fn alice_at_tech_corp(store: &FixtureStore, ctx: Option<&TenantContext>) {
        store
            .add_entity(Entity::new("alice", "Person").with_property("name", "Alice"), ctx)
            .await
            .unwrap();
        store
            .add_entity(Entity::new("tech_corp", "Company"), ctx)
            .await
            .unwrap();
        store
            .add_relation(Relation::new("WORKS_FOR", "alice", "tech_corp"), ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_alice_works_for_tech_corp() {
        let store = FixtureStore::new();
        let ctx = acme();
        alice_at_tech_corp(&store, Some(&ctx)).await;

        let neighbors = store
            .get_neighbors("alice", Direction::Outgoing, &[], Some(&ctx))
            .await
            .unwrap();
        let ids: Vec<&str> = neighbors.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["tech_corp"]);

        let paths = store
            .find_paths("alice", "tech_corp", 1, Some(&ctx))
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].length(), 1);
        assert_eq!(paths[0].relations[0].relation_type, "WORKS_FOR");
    }

    #[tokio::test]
    async fn test_defaults_stay_in_scope() {
        let store = FixtureStore::new();
        let ctx = acme();
        alice_at_tech_corp(&store, Some(&ctx)).await;

        assert_eq!(store.count_entities(Some(&ctx)).await.unwrap(), 2);
        assert_eq!(store.count_relations(Some(&ctx)).await.unwrap(), 1);
        assert_eq!(store.count_entities(None).await.unwrap(), 0);

        let other = TenantContext::shared("globex").unwrap();
        let paths = store.traverse("alice", 3, Some(&other)).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_neighbor_type_filter() {
        let store = FixtureStore::new();
        alice_at_tech_corp(&store, None).await;
        store.add_entity(Entity::new("bob", "Person"), None).await.unwrap();
        store
            .add_relation(Relation::new("KNOWS", "alice", "bob"), None)
            .await
            .unwrap();

        let knows = store
            .get_neighbors("alice", Direction::Outgoing, &["KNOWS".to_string()], None)
            .await
            .unwrap();
        assert_eq!(knows.len(), 1);
        assert_eq!(knows[0].id, "bob");

        let incoming = store
            .get_neighbors("tech_corp", Direction::Incoming, &[], None)
            .await
            .unwrap();
        assert_eq!(incoming[0].id, "alice");
    }

    #[tokio::test]
    async fn test_find_paths_to_self_is_empty() {
        let store = FixtureStore::new();
        alice_at_tech_corp(&store, None).await;
        let paths = store.find_paths("alice", "alice", 3, None).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_fallback() {
        let store = FixtureStore::new();
        store
            .add_entity(Entity::new("doc", "Doc").with_embedding(vec![0.1, 0.2]), None)
            .await
            .unwrap();
        store.add_entity(Entity::new("plain", "Doc"), None).await.unwrap();

        let matches = store.vector_search(&[0.1, 0.2], 10, None).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity.id, "doc");
        assert_eq!(matches[0].score, FALLBACK_SIMILARITY);
    }

    #[tokio::test]
    async fn test_missing_endpoint_without_owner_lookup() {
        let store = FixtureStore::new();
        let t1 = TenantContext::shared("t1").unwrap();
        let t2 = TenantContext::shared("t2").unwrap();
        store.add_entity(Entity::new("a", "Node"), Some(&t1)).await.unwrap();
        store.add_entity(Entity::new("b", "Node"), Some(&t2)).await.unwrap();

        let err = store
            .add_relation(Relation::new("LINKS", "a", "b"), Some(&t1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(id) if id == "b"));
    }

    #[tokio::test]
    async fn test_cross_tenant_detected_with_owner_lookup() {
        let store = FixtureStore::with_owner_lookup();
        let t1 = TenantContext::shared("t1").unwrap();
        let t2 = TenantContext::shared("t2").unwrap();
        store.add_entity(Entity::new("a", "Node"), Some(&t1)).await.unwrap();
        store.add_entity(Entity::new("b", "Node"), Some(&t2)).await.unwrap();

        for ctx in [&t1, &t2] {
            let err = store
                .add_relation(Relation::new("LINKS", "a", "b"), Some(ctx))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::CrossTenantRelation { .. }), "{err}");
        }

        let err = store
            .add_relation(Relation::new("LINKS", "a", "ghost"), Some(&t1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_relation_naming_other_tenant_is_rejected() {
        let store = FixtureStore::new();
        let t1 = TenantContext::shared("t1").unwrap();
        store.add_entity(Entity::new("a", "Node"), Some(&t1)).await.unwrap();
        store.add_entity(Entity::new("b", "Node"), Some(&t1)).await.unwrap();

        let err = store
            .add_relation(Relation::new("LINKS", "a", "b").with_tenant("t2"), Some(&t1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossTenantRelation { .. }));
    }
}
