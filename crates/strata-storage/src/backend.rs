//! Backend selection from configuration

use crate::config::{BackendConfig, StorageConfig};
use crate::error::StorageResult;
use crate::memory::MemoryGraphStore;
use crate::metrics::SharedMetrics;
use async_trait::async_trait;
use strata_core::{
    Direction, Entity, EntityUpdate, GraphQuery, GraphStore, Path, Relation, Result,
    TenantContext, TraversalOptions, VectorMatch,
};

#[cfg(feature = "postgres")]
use crate::postgres::PostgresGraphStore;
#[cfg(feature = "sqlite")]
use crate::sqlite::SqliteGraphStore;

/// Any configured backend behind one [`GraphStore`] implementation
#[derive(Debug)]
pub enum GraphBackend {
    Memory(MemoryGraphStore),
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteGraphStore),
    #[cfg(feature = "postgres")]
    Postgres(PostgresGraphStore),
}

impl GraphBackend {
    /// Build the backend named by `config`. The store still needs
    /// [`GraphStore::initialize`] before use.
    pub async fn open(config: &StorageConfig, metrics: SharedMetrics) -> StorageResult<Self> {
        config.validate()?;
        tracing::info!(
            backend = config.backend.kind(),
            cascade = ?config.cascade,
            "Opening graph store"
        );

        match &config.backend {
            BackendConfig::Memory(memory) => Ok(Self::Memory(MemoryGraphStore::from_config(
                memory,
                config.cascade,
                metrics,
            ))),
            #[cfg(feature = "sqlite")]
            BackendConfig::Sqlite(sqlite) => Ok(Self::Sqlite(SqliteGraphStore::open(
                sqlite,
                config.cascade,
                metrics,
            )?)),
            #[cfg(not(feature = "sqlite"))]
            BackendConfig::Sqlite(_) => Err(crate::StorageError::Config(
                "sqlite backend requires the `sqlite` feature".into(),
            )),
            #[cfg(feature = "postgres")]
            BackendConfig::Postgres(postgres) => Ok(Self::Postgres(
                PostgresGraphStore::connect(postgres, config.cascade, metrics).await?,
            )),
            #[cfg(not(feature = "postgres"))]
            BackendConfig::Postgres(_) => Err(crate::StorageError::Config(
                "postgres backend requires the `postgres` feature".into(),
            )),
        }
    }

    /// Open and initialize in one step
    pub async fn connect(config: &StorageConfig, metrics: SharedMetrics) -> StorageResult<Self> {
        let backend = Self::open(config, metrics).await?;
        backend.initialize().await?;
        Ok(backend)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            GraphBackend::Memory($store) => $call,
            #[cfg(feature = "sqlite")]
            GraphBackend::Sqlite($store) => $call,
            #[cfg(feature = "postgres")]
            GraphBackend::Postgres($store) => $call,
        }
    };
}

#[async_trait]
impl GraphStore for GraphBackend {
    async fn initialize(&self) -> Result<()> {
        dispatch!(self, store => store.initialize().await)
    }

    async fn close(&self) -> Result<()> {
        dispatch!(self, store => store.close().await)
    }

    async fn health_check(&self) -> Result<bool> {
        dispatch!(self, store => store.health_check().await)
    }

    async fn add_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
        dispatch!(self, store => store.add_entity(entity, ctx).await)
    }

    async fn get_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<Option<Entity>> {
        dispatch!(self, store => store.get_entity(id, ctx).await)
    }

    async fn update_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity> {
        dispatch!(self, store => store.update_entity(id, update, ctx).await)
    }

    async fn delete_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        dispatch!(self, store => store.delete_entity(id, ctx).await)
    }

    async fn add_relation(
        &self,
        relation: Relation,
        ctx: Option<&TenantContext>,
    ) -> Result<Relation> {
        dispatch!(self, store => store.add_relation(relation, ctx).await)
    }

    async fn get_relation(
        &self,
        id: &str,
        ctx: Option<&TenantContext>,
    ) -> Result<Option<Relation>> {
        dispatch!(self, store => store.get_relation(id, ctx).await)
    }

    async fn delete_relation(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        dispatch!(self, store => store.delete_relation(id, ctx).await)
    }

    async fn query(&self, query: &GraphQuery, ctx: Option<&TenantContext>) -> Result<Vec<Entity>> {
        dispatch!(self, store => store.query(query, ctx).await)
    }

    async fn query_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Relation>> {
        dispatch!(self, store => store.query_relations(query, ctx).await)
    }

    async fn owning_tenant(&self, entity_id: &str) -> Result<Option<String>> {
        dispatch!(self, store => store.owning_tenant(entity_id).await)
    }

    async fn get_neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<(Relation, Entity)>> {
        dispatch!(self, store => {
            store
                .get_neighbor_edges(entity_id, direction, relation_types, ctx)
                .await
        })
    }

    async fn get_neighbors(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Entity>> {
        dispatch!(self, store => {
            store
                .get_neighbors(entity_id, direction, relation_types, ctx)
                .await
        })
    }

    async fn traverse_with(
        &self,
        options: &TraversalOptions,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Path>> {
        dispatch!(self, store => store.traverse_with(options, ctx).await)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        max_results: usize,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<VectorMatch>> {
        dispatch!(self, store => store.vector_search(embedding, max_results, ctx).await)
    }

    async fn count_entities(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        dispatch!(self, store => store.count_entities(ctx).await)
    }

    async fn count_relations(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        dispatch!(self, store => store.count_relations(ctx).await)
    }
}
