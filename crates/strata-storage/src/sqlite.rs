//! SQLite storage backend
//!
//! Two physical layouts:
//!
//! - one database file shared by every tenant, each row keyed by a
//!   `tenant_id` column (`''` for the global scope), used for the
//!   `disabled` and `shared_schema` isolation modes;
//! - one file per tenant (`<dir>/tenant_{id}.sqlite3`, global data in
//!   `<dir>/global.sqlite3`) for `separate_schema`. Files are opened on
//!   first access and created on first write.
//!
//! Both layouts use the same tables, so every statement is filtered by
//! `tenant_id` either way.

use crate::config::{CascadePolicy, SqliteConfig};
use crate::error::{StorageError, StorageResult};
use crate::metrics::{NoopMetrics, OperationTimer, SharedMetrics};
use crate::migration::Migratable;
use async_trait::async_trait;
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strata_core::graph::classify_missing_endpoint;
use strata_core::tenant::{partition_name, scope_of, PARTITION_PREFIX};
use strata_core::validation::{scope_entity, scope_relation, validate_entity, validate_relation};
use strata_core::vector::rank_by_similarity;
use strata_core::{
    Direction, Entity, EntityUpdate, Error, GraphQuery, GraphStore, IsolationMode, Relation,
    Result, TenantContext, VectorMatch,
};

const BACKEND: &str = "sqlite";
const GLOBAL_FILE: &str = "global.sqlite3";
const FILE_EXTENSION: &str = "sqlite3";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type SharedConnection = Arc<Mutex<Connection>>;

enum Layout {
    Shared(SharedConnection),
    Separate {
        dir: PathBuf,
        files: Mutex<HashMap<String, SharedConnection>>,
    },
}

/// SQLite storage backend
pub struct SqliteGraphStore {
    layout: Layout,
    cascade: CascadePolicy,
    metrics: SharedMetrics,
}

impl SqliteGraphStore {
    /// Open the store described by `config`.
    ///
    /// Shared layouts open (and migrate) the database file immediately;
    /// separate layouts only create the directory.
    pub fn open(
        config: &SqliteConfig,
        cascade: CascadePolicy,
        metrics: SharedMetrics,
    ) -> StorageResult<Self> {
        let layout = match config.isolation_mode {
            IsolationMode::Disabled | IsolationMode::SharedSchema => {
                if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let conn = open_connection(&config.path)?;
                Layout::Shared(Arc::new(Mutex::new(conn)))
            }
            IsolationMode::SeparateSchema => {
                std::fs::create_dir_all(&config.path)?;
                Layout::Separate {
                    dir: config.path.clone(),
                    files: Mutex::new(HashMap::new()),
                }
            }
        };

        tracing::info!(
            path = %config.path.display(),
            isolation = %config.isolation_mode,
            "Opened SQLite graph store"
        );

        Ok(Self {
            layout,
            cascade,
            metrics,
        })
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory(cascade: CascadePolicy) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        SchemaHandle(&conn).migrate_to_latest()?;

        Ok(Self {
            layout: Layout::Shared(Arc::new(Mutex::new(conn))),
            cascade,
            metrics: NoopMetrics::shared(),
        })
    }

    /// File backing a scope in the separate layout
    pub fn partition_path(dir: &Path, scope: Option<&str>) -> PathBuf {
        match scope {
            Some(tenant) => dir.join(format!("{}.{}", partition_name(tenant), FILE_EXTENSION)),
            None => dir.join(GLOBAL_FILE),
        }
    }

    /// Connection for a scope.
    ///
    /// In the separate layout a missing file is created only when `create`
    /// is set; otherwise `None` is returned and the scope reads as empty.
    fn partition(
        &self,
        scope: Option<&str>,
        create: bool,
    ) -> StorageResult<Option<SharedConnection>> {
        let (dir, files) = match &self.layout {
            Layout::Shared(conn) => return Ok(Some(conn.clone())),
            Layout::Separate { dir, files } => (dir, files),
        };

        let key = scope.unwrap_or_default();
        let mut files = files.lock().map_err(StorageError::lock)?;
        if let Some(conn) = files.get(key) {
            return Ok(Some(conn.clone()));
        }

        let path = Self::partition_path(dir, scope);
        let exists = path.exists();
        if !exists && !create {
            return Ok(None);
        }

        let conn = Arc::new(Mutex::new(open_connection(&path)?));
        if exists {
            tracing::debug!(path = %path.display(), "Opened tenant database");
        } else {
            tracing::info!(path = %path.display(), "Created tenant database");
        }
        if let Some(tenant) = scope {
            self.metrics.record_partition_opened(BACKEND, tenant);
        }
        files.insert(key.to_string(), conn.clone());
        Ok(Some(conn))
    }

    /// Run `f` against the scope's database; `None` if the scope has no
    /// database yet and `create` is false
    fn with_conn<T>(
        &self,
        scope: Option<&str>,
        create: bool,
        f: impl FnOnce(&mut Connection, &str) -> StorageResult<T>,
    ) -> StorageResult<Option<T>> {
        let Some(conn) = self.partition(scope, create)? else {
            return Ok(None);
        };
        let mut guard = lock(&conn)?;
        f(&mut guard, scope.unwrap_or_default()).map(Some)
    }

    fn insert_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> StorageResult<Entity> {
        let entity = scope_entity(entity, ctx)?;
        self.with_conn(scope_of(ctx), true, |conn, tenant| {
            let data = serde_json::to_string(&entity)?;
            conn.execute(
                "INSERT INTO entities (tenant_id, id, entity_type, has_embedding, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![tenant, entity.id, entity.entity_type, entity.embedding.is_some(), data],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StorageError::from(Error::EntityExists(entity.id.clone()))
                } else {
                    StorageError::from(e)
                }
            })?;
            tracing::debug!(id = %entity.id, tenant = %tenant, "Added entity");
            Ok(())
        })?;
        Ok(entity)
    }

    fn modify_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Entity> {
        self.with_conn(scope_of(ctx), false, |conn, tenant| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut entity = fetch_entity(&tx, tenant, id)?
                .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;

            update.apply(&mut entity);
            validate_entity(&entity).map_err(Error::from)?;

            let data = serde_json::to_string(&entity)?;
            let changed = tx.execute(
                "UPDATE entities SET entity_type = ?1, has_embedding = ?2, data = ?3 \
                 WHERE tenant_id = ?4 AND id = ?5",
                params![entity.entity_type, entity.embedding.is_some(), data, tenant, id],
            )?;
            if changed != 1 {
                return Err(Error::EntityNotFound(id.to_string()).into());
            }
            tx.commit()?;
            Ok(entity)
        })?
        .ok_or_else(|| Error::EntityNotFound(id.to_string()).into())
    }

    fn remove_entity(&self, id: &str, ctx: Option<&TenantContext>) -> StorageResult<()> {
        let cascade = self.cascade;
        self.with_conn(scope_of(ctx), false, |conn, tenant| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if fetch_entity(&tx, tenant, id)?.is_none() {
                return Err(Error::EntityNotFound(id.to_string()).into());
            }

            let dependents = tx.query_row(
                "SELECT COUNT(*) FROM relations \
                 WHERE tenant_id = ?1 AND (source_id = ?2 OR target_id = ?2)",
                params![tenant, id],
                |row| row.get::<_, i64>(0),
            )? as usize;
            if dependents > 0 && cascade == CascadePolicy::Reject {
                tracing::warn!(
                    id = %id,
                    count = dependents,
                    "Refusing delete of referenced entity"
                );
                return Err(Error::DependentRelations {
                    id: id.to_string(),
                    count: dependents,
                }
                .into());
            }

            tx.execute(
                "DELETE FROM relations WHERE tenant_id = ?1 AND (source_id = ?2 OR target_id = ?2)",
                params![tenant, id],
            )?;
            tx.execute(
                "DELETE FROM entities WHERE tenant_id = ?1 AND id = ?2",
                params![tenant, id],
            )?;
            tx.commit()?;
            tracing::debug!(id = %id, cascaded = dependents, "Deleted entity");
            Ok(())
        })?
        .ok_or_else(|| Error::EntityNotFound(id.to_string()).into())
    }

    /// Insert a scoped relation; a missing endpoint surfaces as
    /// `EntityNotFound` carrying the endpoint id
    fn insert_relation(
        &self,
        relation: Relation,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Relation> {
        let inserted = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let source = fetch_entity(&tx, tenant, &relation.source_id)?
                .ok_or_else(|| Error::EntityNotFound(relation.source_id.clone()))?;
            let target = fetch_entity(&tx, tenant, &relation.target_id)?
                .ok_or_else(|| Error::EntityNotFound(relation.target_id.clone()))?;
            validate_relation(&relation, &source, &target)?;

            let data = serde_json::to_string(&relation)?;
            tx.execute(
                "INSERT INTO relations \
                 (tenant_id, id, relation_type, source_id, target_id, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tenant,
                    relation.id,
                    relation.relation_type,
                    relation.source_id,
                    relation.target_id,
                    data
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StorageError::from(Error::RelationExists(relation.id.clone()))
                } else {
                    StorageError::from(e)
                }
            })?;
            tx.commit()?;
            Ok(())
        })?;

        match inserted {
            Some(()) => Ok(relation),
            None => Err(Error::EntityNotFound(relation.source_id).into()),
        }
    }

    fn neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Vec<(Relation, Entity)>> {
        let edges = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            let mut edges = Vec::new();
            if matches!(direction, Direction::Outgoing | Direction::Both) {
                edges.extend(join_neighbors(conn, tenant, entity_id, true, relation_types)?);
            }
            if matches!(direction, Direction::Incoming | Direction::Both) {
                edges.extend(join_neighbors(conn, tenant, entity_id, false, relation_types)?);
            }
            Ok(edges)
        })?;

        // A self-loop shows up on both sides when following both directions
        let mut seen = HashSet::new();
        Ok(edges
            .unwrap_or_default()
            .into_iter()
            .filter(|(relation, _)| seen.insert(relation.id.clone()))
            .collect())
    }

    fn owner_of(&self, entity_id: &str) -> StorageResult<Option<String>> {
        match &self.layout {
            Layout::Shared(conn) => {
                let conn = lock(conn)?;
                let owner = conn
                    .query_row(
                        "SELECT tenant_id FROM entities WHERE id = ?1 AND tenant_id <> '' LIMIT 1",
                        params![entity_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(owner)
            }
            Layout::Separate { dir, files } => {
                for tenant in tenant_files(dir)? {
                    // Files nobody has opened are read through a throwaway
                    // handle so the lookup does not grow the partition cache
                    let cached = files
                        .lock()
                        .map_err(StorageError::lock)?
                        .get(&tenant)
                        .cloned();
                    let found = match cached {
                        Some(conn) => fetch_entity(&*lock(&conn)?, &tenant, entity_id)?.is_some(),
                        None => {
                            let path = Self::partition_path(dir, Some(&tenant));
                            let conn = open_read_only(&path)?;
                            fetch_entity(&conn, &tenant, entity_id)?.is_some()
                        }
                    };
                    if found {
                        return Ok(Some(tenant));
                    }
                }
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for SqliteGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let layout = match &self.layout {
            Layout::Shared(_) => "shared".to_string(),
            Layout::Separate { dir, .. } => format!("separate({})", dir.display()),
        };
        f.debug_struct("SqliteGraphStore")
            .field("layout", &layout)
            .field("cascade", &self.cascade)
            .finish_non_exhaustive()
    }
}

fn open_connection(path: &Path) -> StorageResult<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        StorageError::Connection(format!("Failed to open {}: {}", path.display(), e))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    SchemaHandle(&conn).migrate_to_latest()?;
    Ok(conn)
}

fn open_read_only(path: &Path) -> StorageResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        StorageError::Connection(format!("Failed to open {}: {}", path.display(), e))
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn lock(conn: &Mutex<Connection>) -> StorageResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(StorageError::lock)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Tenant ids with a database file in `dir`
fn tenant_files(dir: &Path) -> StorageResult<Vec<String>> {
    let mut tenants = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }
        let tenant = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(PARTITION_PREFIX));
        if let Some(tenant) = tenant {
            tenants.push(tenant.to_string());
        }
    }
    tenants.sort();
    Ok(tenants)
}

fn fetch_entity(conn: &Connection, tenant: &str, id: &str) -> StorageResult<Option<Entity>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM entities WHERE tenant_id = ?1 AND id = ?2",
            params![tenant, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
}

fn fetch_relation(conn: &Connection, tenant: &str, id: &str) -> StorageResult<Option<Relation>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM relations WHERE tenant_id = ?1 AND id = ?2",
            params![tenant, id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
}

/// SQL LIMIT clause, only when no predicate is evaluated after the fetch
fn limit_clause(query: &GraphQuery) -> String {
    match query.limit {
        Some(limit) if !query.has_predicates() => format!(" LIMIT {}", limit),
        _ => String::new(),
    }
}

fn select_entities(
    conn: &Connection,
    tenant: &str,
    query: &GraphQuery,
) -> StorageResult<Vec<Entity>> {
    let mut sql = String::from("SELECT data FROM entities WHERE tenant_id = ?1");
    let mut values = vec![tenant.to_string()];
    if let Some(entity_type) = &query.entity_type {
        values.push(entity_type.clone());
        sql.push_str(&format!(" AND entity_type = ?{}", values.len()));
    }
    sql.push_str(" ORDER BY id");
    sql.push_str(&limit_clause(query));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

    let mut entities = Vec::new();
    for row in rows {
        entities.push(serde_json::from_str(&row?)?);
    }
    Ok(query.finish_entities(entities))
}

fn select_relations(
    conn: &Connection,
    tenant: &str,
    query: &GraphQuery,
) -> StorageResult<Vec<Relation>> {
    let mut sql = String::from("SELECT data FROM relations WHERE tenant_id = ?1");
    let mut values = vec![tenant.to_string()];
    let filters = [
        ("relation_type", &query.relation_type),
        ("source_id", &query.source_id),
        ("target_id", &query.target_id),
    ];
    for (column, value) in filters {
        if let Some(value) = value {
            values.push(value.clone());
            sql.push_str(&format!(" AND {} = ?{}", column, values.len()));
        }
    }
    sql.push_str(" ORDER BY rowid");
    sql.push_str(&limit_clause(query));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?;

    let mut relations = Vec::new();
    for row in rows {
        relations.push(serde_json::from_str(&row?)?);
    }
    Ok(query.finish_relations(relations))
}

/// One-hop neighbors through a single JOIN; `outgoing` picks the side
fn join_neighbors(
    conn: &Connection,
    tenant: &str,
    entity_id: &str,
    outgoing: bool,
    relation_types: &[String],
) -> StorageResult<Vec<(Relation, Entity)>> {
    let (anchor, far) = if outgoing {
        ("source_id", "target_id")
    } else {
        ("target_id", "source_id")
    };

    let mut sql = format!(
        "SELECT r.data, e.data FROM relations r \
         JOIN entities e ON e.tenant_id = r.tenant_id AND e.id = r.{far} \
         WHERE r.tenant_id = ?1 AND r.{anchor} = ?2"
    );
    let mut values = vec![tenant.to_string(), entity_id.to_string()];
    if !relation_types.is_empty() {
        let placeholders: Vec<String> = (0..relation_types.len())
            .map(|i| format!("?{}", i + 3))
            .collect();
        sql.push_str(&format!(" AND r.relation_type IN ({})", placeholders.join(", ")));
        values.extend(relation_types.iter().cloned());
    }
    sql.push_str(" ORDER BY r.rowid");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut edges = Vec::new();
    for row in rows {
        let (relation, entity) = row?;
        edges.push((serde_json::from_str(&relation)?, serde_json::from_str(&entity)?));
    }
    Ok(edges)
}

/// Schema bookkeeping for one database file
struct SchemaHandle<'a>(&'a Connection);

impl Migratable for SchemaHandle<'_> {
    fn get_schema_version(&self) -> StorageResult<u32> {
        self.0.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
        )?;
        let version: Option<u32> =
            self.0
                .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
        Ok(version.unwrap_or(0))
    }

    fn set_schema_version(&self, version: u32) -> StorageResult<()> {
        self.0.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![version],
        )?;
        Ok(())
    }

    fn run_migration(&self, version: u32) -> StorageResult<()> {
        let sql = match version {
            1 => {
                r#"
                CREATE TABLE IF NOT EXISTS entities (
                    tenant_id TEXT NOT NULL DEFAULT '',
                    id TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (tenant_id, id)
                );

                CREATE TABLE IF NOT EXISTS relations (
                    tenant_id TEXT NOT NULL DEFAULT '',
                    id TEXT NOT NULL,
                    relation_type TEXT NOT NULL,
                    source_id TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    PRIMARY KEY (tenant_id, id)
                );

                CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(tenant_id, entity_type);
                CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(tenant_id, source_id);
                CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(tenant_id, target_id);
                CREATE INDEX IF NOT EXISTS idx_relations_type ON relations(tenant_id, relation_type);
                "#
            }
            2 => {
                r#"
                ALTER TABLE entities ADD COLUMN has_embedding INTEGER NOT NULL DEFAULT 0;
                UPDATE entities SET has_embedding = 1
                    WHERE json_extract(data, '$.embedding') IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_entities_embedding ON entities(tenant_id, has_embedding);
                CREATE INDEX IF NOT EXISTS idx_entities_id ON entities(id);
                "#
            }
            other => {
                return Err(StorageError::Migration(format!(
                    "No migration defined for schema version {}",
                    other
                )))
            }
        };
        self.0.execute_batch(sql)?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn initialize(&self) -> Result<()> {
        tracing::info!("Initialized SQLite graph store");
        self.metrics.on_open(BACKEND);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Layout::Separate { files, .. } = &self.layout {
            let mut files = files.lock().map_err(StorageError::lock)?;
            tracing::debug!(open = files.len(), "Closing tenant databases");
            files.clear();
        }
        tracing::info!("Closed SQLite graph store");
        self.metrics.on_close(BACKEND);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match &self.layout {
            Layout::Shared(conn) => {
                let conn = lock(conn)?;
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(StorageError::from)?;
                Ok(true)
            }
            Layout::Separate { dir, .. } => Ok(dir.is_dir()),
        }
    }

    // Entity operations

    async fn add_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "add_entity");
        timer.finish(self.insert_entity(entity, ctx).map_err(Into::into))
    }

    async fn get_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<Option<Entity>> {
        let entity = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            fetch_entity(conn, tenant, id)
        })?;
        Ok(entity.flatten())
    }

    async fn update_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "update_entity");
        timer.finish(self.modify_entity(id, update, ctx).map_err(Into::into))
    }

    async fn delete_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "delete_entity");
        timer.finish(self.remove_entity(id, ctx).map_err(Into::into))
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
        let result = match self.insert_relation(relation.clone(), ctx).map_err(Error::from) {
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
        let relation = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            fetch_relation(conn, tenant, id)
        })?;
        Ok(relation.flatten())
    }

    async fn delete_relation(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let changed = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            Ok(conn.execute(
                "DELETE FROM relations WHERE tenant_id = ?1 AND id = ?2",
                params![tenant, id],
            )?)
        })?;
        match changed {
            Some(n) if n > 0 => Ok(()),
            _ => Err(Error::RelationNotFound(id.to_string())),
        }
    }

    // Queries

    async fn query(&self, query: &GraphQuery, ctx: Option<&TenantContext>) -> Result<Vec<Entity>> {
        let entities = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            select_entities(conn, tenant, query)
        })?;
        Ok(entities.unwrap_or_default())
    }

    async fn query_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Relation>> {
        let relations = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            select_relations(conn, tenant, query)
        })?;
        Ok(relations.unwrap_or_default())
    }

    async fn owning_tenant(&self, entity_id: &str) -> Result<Option<String>> {
        Ok(self.owner_of(entity_id)?)
    }

    // Graph operations

    async fn get_neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<(Relation, Entity)>> {
        Ok(self.neighbor_edges(entity_id, direction, relation_types, ctx)?)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        max_results: usize,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<VectorMatch>> {
        let candidates = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            let mut stmt = conn.prepare(
                "SELECT data FROM entities WHERE tenant_id = ?1 AND has_embedding = 1",
            )?;
            let rows = stmt.query_map(params![tenant], |row| row.get::<_, String>(0))?;
            let mut entities: Vec<Entity> = Vec::new();
            for row in rows {
                entities.push(serde_json::from_str(&row?)?);
            }
            Ok(entities)
        })?;
        Ok(rank_by_similarity(
            embedding,
            candidates.unwrap_or_default(),
            max_results,
        ))
    }

    async fn count_entities(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        let count = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM entities WHERE tenant_id = ?1",
                params![tenant],
                |row| row.get::<_, i64>(0),
            )? as usize)
        })?;
        Ok(count.unwrap_or(0))
    }

    async fn count_relations(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        let count = self.with_conn(scope_of(ctx), false, |conn, tenant| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM relations WHERE tenant_id = ?1",
                params![tenant],
                |row| row.get::<_, i64>(0),
            )? as usize)
        })?;
        Ok(count.unwrap_or(0))
    }
}
