//! In-memory storage backend
//!
//! Each tenant gets its own graph (entity map, relation map, adjacency
//! indexes) held in an LRU bounded by `max_tenant_graphs`; the global graph
//! used by disabled contexts lives outside the LRU and is never evicted.
//! Evicting a tenant graph drops its data, so this backend suits tests and
//! caches but should not be the only copy of production data.

use crate::config::{CascadePolicy, MemoryConfig, DEFAULT_MAX_TENANT_GRAPHS};
use crate::error::StorageError;
use crate::metrics::{NoopMetrics, OperationTimer, SharedMetrics};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use strata_core::graph::classify_missing_endpoint;
use strata_core::tenant::scope_of;
use strata_core::validation::{scope_entity, scope_relation, validate_entity, validate_relation};
use strata_core::vector::rank_by_similarity;
use strata_core::{
    Direction, Entity, EntityUpdate, Error, GraphQuery, GraphStore, Relation, Result,
    TenantContext, VectorMatch,
};

const BACKEND: &str = "memory";

/// One tenant's graph
#[derive(Debug, Default)]
struct PartitionGraph {
    entities: BTreeMap<String, Entity>,
    relations: BTreeMap<String, Relation>,
    /// entity id -> ids of relations leaving it, in insertion order
    outgoing: HashMap<String, Vec<String>>,
    /// entity id -> ids of relations entering it, in insertion order
    incoming: HashMap<String, Vec<String>>,
}

impl PartitionGraph {
    fn insert_relation(&mut self, relation: Relation) {
        self.outgoing
            .entry(relation.source_id.clone())
            .or_default()
            .push(relation.id.clone());
        self.incoming
            .entry(relation.target_id.clone())
            .or_default()
            .push(relation.id.clone());
        self.relations.insert(relation.id.clone(), relation);
    }

    fn remove_relation(&mut self, id: &str) -> Option<Relation> {
        let relation = self.relations.remove(id)?;
        if let Some(ids) = self.outgoing.get_mut(&relation.source_id) {
            ids.retain(|r| r != id);
        }
        if let Some(ids) = self.incoming.get_mut(&relation.target_id) {
            ids.retain(|r| r != id);
        }
        Some(relation)
    }

    /// Ids of relations touching `entity_id` in `direction`, without repeats
    fn adjacent(&self, entity_id: &str, direction: Direction) -> Vec<String> {
        let outgoing = self.outgoing.get(entity_id).into_iter().flatten();
        let incoming = self.incoming.get(entity_id).into_iter().flatten();
        let ids: Vec<&String> = match direction {
            Direction::Outgoing => outgoing.collect(),
            Direction::Incoming => incoming.collect(),
            Direction::Both => outgoing.chain(incoming).collect(),
        };
        let mut seen = HashSet::new();
        ids.into_iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}

struct Partitions {
    global: PartitionGraph,
    tenants: LruCache<String, PartitionGraph>,
}

impl Partitions {
    /// Existing partition for reading; never creates one
    fn read(&mut self, scope: Option<&str>) -> Option<&PartitionGraph> {
        match scope {
            None => Some(&self.global),
            Some(tenant) => self.tenants.get(tenant),
        }
    }

    fn write(&mut self, scope: Option<&str>) -> Option<&mut PartitionGraph> {
        match scope {
            None => Some(&mut self.global),
            Some(tenant) => self.tenants.get_mut(tenant),
        }
    }
}

/// In-memory storage backend
pub struct MemoryGraphStore {
    partitions: Mutex<Partitions>,
    cascade: CascadePolicy,
    metrics: SharedMetrics,
}

impl MemoryGraphStore {
    pub fn new(max_tenant_graphs: usize, cascade: CascadePolicy, metrics: SharedMetrics) -> Self {
        let capacity = NonZeroUsize::new(max_tenant_graphs).unwrap_or(NonZeroUsize::MIN);
        Self {
            partitions: Mutex::new(Partitions {
                global: PartitionGraph::default(),
                tenants: LruCache::new(capacity),
            }),
            cascade,
            metrics,
        }
    }

    pub fn from_config(
        config: &MemoryConfig,
        cascade: CascadePolicy,
        metrics: SharedMetrics,
    ) -> Self {
        Self::new(config.max_tenant_graphs, cascade, metrics)
    }

    /// Number of tenant graphs currently held (the global graph excluded)
    pub fn tenant_graph_count(&self) -> Result<usize> {
        Ok(self.lock()?.tenants.len())
    }

    /// Whether a tenant graph is resident, without touching its recency
    pub fn has_tenant_graph(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.lock()?.tenants.contains(tenant_id))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Partitions>> {
        self.partitions
            .lock()
            .map_err(|e| StorageError::lock(e).into())
    }

    /// Partition for a write, creating the tenant graph on first use
    fn open_partition<'a>(
        &self,
        partitions: &'a mut Partitions,
        scope: Option<&str>,
    ) -> &'a mut PartitionGraph {
        if let Some(tenant) = scope {
            if partitions.tenants.contains(tenant) {
                partitions.tenants.promote(tenant);
            } else {
                tracing::info!(tenant = %tenant, "Creating tenant graph");
                self.metrics.record_partition_opened(BACKEND, tenant);
                if let Some((evicted, graph)) =
                    partitions.tenants.push(tenant.to_string(), PartitionGraph::default())
                {
                    tracing::warn!(
                        tenant = %evicted,
                        entities = graph.entities.len(),
                        "Evicted least recently used tenant graph"
                    );
                    self.metrics.record_eviction(BACKEND, &evicted);
                }
            }
        }
        match scope {
            Some(tenant) => partitions
                .tenants
                .get_or_insert_mut(tenant.to_string(), PartitionGraph::default),
            None => &mut partitions.global,
        }
    }

    fn insert_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
        let entity = scope_entity(entity, ctx)?;
        let mut partitions = self.lock()?;
        let graph = self.open_partition(&mut partitions, scope_of(ctx));
        if graph.entities.contains_key(&entity.id) {
            return Err(Error::EntityExists(entity.id));
        }
        graph.entities.insert(entity.id.clone(), entity.clone());
        tracing::debug!(id = %entity.id, tenant = ?scope_of(ctx), "Added entity");
        Ok(entity)
    }

    fn modify_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity> {
        let mut partitions = self.lock()?;
        let entity = partitions
            .write(scope_of(ctx))
            .and_then(|graph| graph.entities.get_mut(id))
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

        let mut updated = entity.clone();
        update.apply(&mut updated);
        validate_entity(&updated)?;
        *entity = updated.clone();
        Ok(updated)
    }

    fn remove_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let mut partitions = self.lock()?;
        let graph = partitions
            .write(scope_of(ctx))
            .filter(|graph| graph.entities.contains_key(id))
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

        let dependents = graph.adjacent(id, Direction::Both);
        if !dependents.is_empty() && self.cascade == CascadePolicy::Reject {
            tracing::warn!(
                id = %id,
                count = dependents.len(),
                "Refusing delete of referenced entity"
            );
            return Err(Error::DependentRelations {
                id: id.to_string(),
                count: dependents.len(),
            });
        }

        for relation_id in &dependents {
            graph.remove_relation(relation_id);
        }
        graph.outgoing.remove(id);
        graph.incoming.remove(id);
        graph.entities.remove(id);
        tracing::debug!(id = %id, cascaded = dependents.len(), "Deleted entity");
        Ok(())
    }

    /// Insert a scoped relation; a missing endpoint is reported as
    /// `EntityNotFound` with the endpoint id for the caller to classify
    fn insert_relation(&self, relation: Relation, ctx: Option<&TenantContext>) -> Result<Relation> {
        let mut partitions = self.lock()?;
        let Some(graph) = partitions.write(scope_of(ctx)) else {
            return Err(Error::EntityNotFound(relation.source_id));
        };

        let source = graph
            .entities
            .get(&relation.source_id)
            .ok_or_else(|| Error::EntityNotFound(relation.source_id.clone()))?;
        let target = graph
            .entities
            .get(&relation.target_id)
            .ok_or_else(|| Error::EntityNotFound(relation.target_id.clone()))?;
        validate_relation(&relation, source, target)?;

        if graph.relations.contains_key(&relation.id) {
            return Err(Error::RelationExists(relation.id));
        }
        graph.insert_relation(relation.clone());
        Ok(relation)
    }

    fn neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<(Relation, Entity)>> {
        let mut partitions = self.lock()?;
        let Some(graph) = partitions.read(scope_of(ctx)) else {
            return Ok(Vec::new());
        };

        let mut edges = Vec::new();
        for relation_id in graph.adjacent(entity_id, direction) {
            let Some(relation) = graph.relations.get(&relation_id) else {
                continue;
            };
            if !relation_types.is_empty() && !relation_types.contains(&relation.relation_type) {
                continue;
            }
            let Some(other) = relation.follow(entity_id, direction) else {
                continue;
            };
            // Dangling ends (absent from this partition) are never followed
            if let Some(entity) = graph.entities.get(other) {
                edges.push((relation.clone(), entity.clone()));
            }
        }
        Ok(edges)
    }

    #[cfg(test)]
    fn inject_raw_relation(&self, relation: Relation, scope: Option<&str>) {
        let mut partitions = self.lock().unwrap();
        let graph = self.open_partition(&mut partitions, scope);
        graph.insert_relation(relation);
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TENANT_GRAPHS, CascadePolicy::default(), NoopMetrics::shared())
    }
}

impl std::fmt::Debug for MemoryGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGraphStore")
            .field("cascade", &self.cascade)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn initialize(&self) -> Result<()> {
        tracing::info!("Initialized in-memory graph store");
        self.metrics.on_open(BACKEND);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tracing::info!("Closed in-memory graph store");
        self.metrics.on_close(BACKEND);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.lock().is_ok())
    }

    // Entity operations

    async fn add_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "add_entity");
        timer.finish(self.insert_entity(entity, ctx))
    }

    async fn get_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<Option<Entity>> {
        let mut partitions = self.lock()?;
        Ok(partitions
            .read(scope_of(ctx))
            .and_then(|graph| graph.entities.get(id))
            .cloned())
    }

    async fn update_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "update_entity");
        timer.finish(self.modify_entity(id, update, ctx))
    }

    async fn delete_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "delete_entity");
        timer.finish(self.remove_entity(id, ctx))
    }

    // Relation operations

    async fn add_relation(
        &self,
        relation: Relation,
        ctx: Option<&TenantContext>,
    ) -> Result<Relation> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "add_relation");
        let relation = match scope_relation(relation, ctx) {
            Ok(relation) => relation,
            Err(e) => return timer.finish(Err(e)),
        };
        let result = match self.insert_relation(relation.clone(), ctx) {
            Err(Error::EntityNotFound(missing)) => {
                Err(classify_missing_endpoint(self, &missing, &relation, ctx).await)
            }
            other => other,
        };
        timer.finish(result)
    }

    async fn get_relation(
        &self,
        id: &str,
        ctx: Option<&TenantContext>,
    ) -> Result<Option<Relation>> {
        let mut partitions = self.lock()?;
        Ok(partitions
            .read(scope_of(ctx))
            .and_then(|graph| graph.relations.get(id))
            .cloned())
    }

    async fn delete_relation(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let mut partitions = self.lock()?;
        partitions
            .write(scope_of(ctx))
            .and_then(|graph| graph.remove_relation(id))
            .map(|_| ())
            .ok_or_else(|| Error::RelationNotFound(id.to_string()))
    }

    // Queries

    async fn query(&self, query: &GraphQuery, ctx: Option<&TenantContext>) -> Result<Vec<Entity>> {
        let mut partitions = self.lock()?;
        let Some(graph) = partitions.read(scope_of(ctx)) else {
            return Ok(Vec::new());
        };
        Ok(query.finish_entities(graph.entities.values().cloned()))
    }

    async fn query_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Relation>> {
        let mut partitions = self.lock()?;
        let Some(graph) = partitions.read(scope_of(ctx)) else {
            return Ok(Vec::new());
        };

        let relations: Vec<Relation> = match (&query.source_id, &query.target_id) {
            (Some(source), _) => graph
                .adjacent(source, Direction::Outgoing)
                .iter()
                .filter_map(|id| graph.relations.get(id).cloned())
                .collect(),
            (None, Some(target)) => graph
                .adjacent(target, Direction::Incoming)
                .iter()
                .filter_map(|id| graph.relations.get(id).cloned())
                .collect(),
            (None, None) => graph.relations.values().cloned().collect(),
        };
        Ok(query.finish_relations(relations))
    }

    async fn owning_tenant(&self, entity_id: &str) -> Result<Option<String>> {
        let partitions = self.lock()?;
        Ok(partitions
            .tenants
            .iter()
            .find(|(_, graph)| graph.entities.contains_key(entity_id))
            .map(|(tenant, _)| tenant.clone()))
    }

    // Graph operations

    async fn get_neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<(Relation, Entity)>> {
        self.neighbor_edges(entity_id, direction, relation_types, ctx)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        max_results: usize,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<VectorMatch>> {
        let mut partitions = self.lock()?;
        let Some(graph) = partitions.read(scope_of(ctx)) else {
            return Ok(Vec::new());
        };
        Ok(rank_by_similarity(embedding, graph.entities.values().cloned(), max_results))
    }

    async fn count_entities(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        let mut partitions = self.lock()?;
        Ok(partitions
            .read(scope_of(ctx))
            .map_or(0, |graph| graph.entities.len()))
    }

    async fn count_relations(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        let mut partitions = self.lock()?;
        Ok(partitions
            .read(scope_of(ctx))
            .map_or(0, |graph| graph.relations.len()))
    }
}
