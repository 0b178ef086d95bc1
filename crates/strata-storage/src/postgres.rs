//! PostgreSQL storage backend
//!
//! `shared_schema` keeps every tenant in `strata_entities`/`strata_relations`
//! filtered by a `tenant_id` column. With `enable_rls` the tables also carry
//! row-level security policies keyed on the transaction-local
//! `strata.tenant_id` setting, which is set inside the same transaction as
//! every statement. Cross-tenant endpoint checks read `strata_entity_owners`,
//! a trigger-maintained index of entity ids and their tenants that carries
//! no entity data.
//!
//! `separate_schema` gives each tenant its own `tenant_{id}` schema (global
//! data lives in `strata_global`), created on first write and selected per
//! transaction through `search_path`.

use crate::config::{CascadePolicy, PostgresConfig};
use crate::error::{StorageError, StorageResult};
use crate::metrics::{OperationTimer, SharedMetrics};
use crate::migration::{describe, CURRENT_VERSION};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgConnection, Postgres, Row, Transaction};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use strata_core::graph::classify_missing_endpoint;
use strata_core::tenant::{partition_name, scope_of, PARTITION_PREFIX};
use strata_core::validation::{scope_entity, scope_relation, validate_entity, validate_relation};
use strata_core::vector::rank_by_similarity;
use strata_core::{
    Direction, Entity, EntityUpdate, Error, GraphQuery, GraphStore, IsolationMode, Relation,
    Result, TenantContext, VectorMatch,
};

const BACKEND: &str = "postgres";

/// Schema holding global-scope data in the separate-schema layout
pub const GLOBAL_SCHEMA: &str = "strata_global";

/// Setting carrying the active tenant for row-level security
pub const TENANT_SETTING: &str = "strata.tenant_id";

const TABLES: [&str; 2] = ["strata_entities", "strata_relations"];

/// Index of which tenant owns which entity id, kept in step with
/// `strata_entities` by trigger. Holds no entity data, so it stays outside
/// row-level security.
const OWNER_INDEX_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS strata_entity_owners (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        PRIMARY KEY (id, tenant_id)
    );

    CREATE OR REPLACE FUNCTION strata_index_entity_owner() RETURNS trigger
    LANGUAGE plpgsql AS $$
    BEGIN
        IF TG_OP = 'INSERT' THEN
            INSERT INTO strata_entity_owners (id, tenant_id) VALUES (NEW.id, NEW.tenant_id)
                ON CONFLICT DO NOTHING;
            RETURN NEW;
        END IF;
        DELETE FROM strata_entity_owners WHERE id = OLD.id AND tenant_id = OLD.tenant_id;
        RETURN OLD;
    END
    $$;

    DROP TRIGGER IF EXISTS strata_entities_owner_index ON strata_entities;
    CREATE TRIGGER strata_entities_owner_index
        AFTER INSERT OR DELETE ON strata_entities
        FOR EACH ROW EXECUTE FUNCTION strata_index_entity_owner();

    ALTER TABLE strata_entities NO FORCE ROW LEVEL SECURITY;
    INSERT INTO strata_entity_owners (id, tenant_id)
        SELECT id, tenant_id FROM strata_entities
        ON CONFLICT DO NOTHING;
"#;

/// PostgreSQL storage backend
pub struct PostgresGraphStore {
    pool: PgPool,
    isolation: IsolationMode,
    enable_rls: bool,
    cascade: CascadePolicy,
    metrics: SharedMetrics,
    /// Schemas known to exist and be migrated (separate layout)
    schemas: Mutex<HashSet<String>>,
}

impl PostgresGraphStore {
    /// Connect a pool; tables are created by `initialize`
    pub async fn connect(
        config: &PostgresConfig,
        cascade: CascadePolicy,
        metrics: SharedMetrics,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::Connection(format!("PostgreSQL: {}", e)))?;

        tracing::info!(
            isolation = %config.isolation_mode,
            rls = config.enable_rls,
            max_connections = config.max_connections,
            "Connected PostgreSQL graph store"
        );

        Ok(Self {
            pool,
            isolation: config.isolation_mode,
            enable_rls: config.enable_rls,
            cascade,
            metrics,
            schemas: Mutex::new(HashSet::new()),
        })
    }

    fn separate(&self) -> bool {
        self.isolation == IsolationMode::SeparateSchema
    }

    fn row_security(&self) -> bool {
        self.enable_rls && self.isolation == IsolationMode::SharedSchema
    }

    fn schema_name(scope: Option<&str>) -> String {
        scope.map_or_else(|| GLOBAL_SCHEMA.to_string(), partition_name)
    }

    fn schema_known(&self, schema: &str) -> StorageResult<bool> {
        let schemas = self.schemas.lock().map_err(StorageError::lock)?;
        Ok(schemas.contains(schema))
    }

    /// Make sure the scope's schema exists; creates it only when `create`
    /// is set. Returns false when it does not exist.
    async fn ensure_schema(&self, scope: Option<&str>, create: bool) -> StorageResult<bool> {
        let schema = Self::schema_name(scope);
        if self.schema_known(&schema)? {
            return Ok(true);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)")
                .bind(&schema)
                .fetch_one(&self.pool)
                .await?;
        if !exists && !create {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        lock_schema(&mut tx, &schema).await?;
        if !exists {
            (&mut *tx)
                .execute(sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&schema))))
                .await?;
            tracing::info!(schema = %schema, "Created tenant schema");
        }
        migrate(&mut tx, Some(&schema)).await?;
        tx.commit().await?;

        if let Some(tenant) = scope {
            self.metrics.record_partition_opened(BACKEND, tenant);
        }
        self.schemas
            .lock()
            .map_err(StorageError::lock)?
            .insert(schema);
        Ok(true)
    }

    /// Begin a transaction bound to the scope.
    ///
    /// `None` means the scope has no schema yet and `create` was false.
    async fn begin_scoped(
        &self,
        scope: Option<&str>,
        create: bool,
    ) -> StorageResult<Option<Transaction<'static, Postgres>>> {
        if self.separate() && !self.ensure_schema(scope, create).await? {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;
        if self.separate() {
            sqlx::query("SELECT set_config('search_path', $1, true)")
                .bind(quote_ident(&Self::schema_name(scope)))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(TENANT_SETTING)
            .bind(scope.unwrap_or_default())
            .execute(&mut *tx)
            .await?;
        Ok(Some(tx))
    }

    /// Install the owner index and the tenant isolation policies in one
    /// implicit transaction, serialized with migrations
    async fn apply_rls(&self) -> StorageResult<()> {
        let mut sql =
            String::from("SELECT pg_advisory_xact_lock(hashtext('strata_migrate:public'));");
        sql.push_str(OWNER_INDEX_SQL);
        for table in TABLES {
            sql.push_str(&format!(
                r#"
                ALTER TABLE {table} ENABLE ROW LEVEL SECURITY;
                ALTER TABLE {table} FORCE ROW LEVEL SECURITY;
                DROP POLICY IF EXISTS {table}_tenant_isolation ON {table};
                CREATE POLICY {table}_tenant_isolation ON {table} FOR ALL
                    USING (tenant_id = coalesce(current_setting('{TENANT_SETTING}', true), ''))
                    WITH CHECK (tenant_id = coalesce(current_setting('{TENANT_SETTING}', true), ''));
                "#
            ));
        }
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        tracing::info!("Row-level security policies installed");
        Ok(())
    }

    async fn insert_entity(
        &self,
        entity: Entity,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Entity> {
        let entity = scope_entity(entity, ctx)?;
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, true).await? else {
            return Err(StorageError::Database("tenant schema unavailable".into()));
        };

        sqlx::query(
            "INSERT INTO strata_entities (tenant_id, id, entity_type, data) \
             VALUES ($1, $2, $3, $4::json)",
        )
        .bind(scope.unwrap_or_default())
        .bind(&entity.id)
        .bind(&entity.entity_type)
        .bind(serde_json::to_string(&entity)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::from(Error::EntityExists(entity.id.clone()))
            } else {
                StorageError::from(e)
            }
        })?;
        tx.commit().await?;
        tracing::debug!(id = %entity.id, tenant = ?scope, "Added entity");
        Ok(entity)
    }

    async fn fetch_entity(
        &self,
        id: &str,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Option<Entity>> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(None);
        };
        let entity = select_entity(&mut tx, scope.unwrap_or_default(), id, false).await?;
        tx.commit().await?;
        Ok(entity)
    }

    async fn modify_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Entity> {
        let scope = scope_of(ctx);
        let tenant = scope.unwrap_or_default();
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Err(Error::EntityNotFound(id.to_string()).into());
        };

        let mut entity = select_entity(&mut tx, tenant, id, true)
            .await?
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))?;
        update.apply(&mut entity);
        validate_entity(&entity).map_err(Error::from)?;

        let changed = sqlx::query(
            "UPDATE strata_entities SET entity_type = $1, data = $2::json \
             WHERE tenant_id = $3 AND id = $4",
        )
        .bind(&entity.entity_type)
        .bind(serde_json::to_string(&entity)?)
        .bind(tenant)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed != 1 {
            return Err(Error::EntityNotFound(id.to_string()).into());
        }
        tx.commit().await?;
        Ok(entity)
    }

    async fn remove_entity(&self, id: &str, ctx: Option<&TenantContext>) -> StorageResult<()> {
        let scope = scope_of(ctx);
        let tenant = scope.unwrap_or_default();
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Err(Error::EntityNotFound(id.to_string()).into());
        };

        if select_entity(&mut tx, tenant, id, true).await?.is_none() {
            return Err(Error::EntityNotFound(id.to_string()).into());
        }

        let dependents: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM strata_relations \
             WHERE tenant_id = $1 AND (source_id = $2 OR target_id = $2)",
        )
        .bind(tenant)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if dependents > 0 && self.cascade == CascadePolicy::Reject {
            tracing::warn!(id = %id, count = dependents, "Refusing delete of referenced entity");
            return Err(Error::DependentRelations {
                id: id.to_string(),
                count: dependents as usize,
            }
            .into());
        }

        sqlx::query(
            "DELETE FROM strata_relations \
             WHERE tenant_id = $1 AND (source_id = $2 OR target_id = $2)",
        )
        .bind(tenant)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM strata_entities WHERE tenant_id = $1 AND id = $2")
            .bind(tenant)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::debug!(id = %id, cascaded = dependents, "Deleted entity");
        Ok(())
    }

    /// Insert a scoped relation; a missing endpoint surfaces as
    /// `EntityNotFound` carrying the endpoint id
    async fn insert_relation(
        &self,
        relation: Relation,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Relation> {
        let scope = scope_of(ctx);
        let tenant = scope.unwrap_or_default();
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Err(Error::EntityNotFound(relation.source_id).into());
        };

        let source = select_entity(&mut tx, tenant, &relation.source_id, false)
            .await?
            .ok_or_else(|| Error::EntityNotFound(relation.source_id.clone()))?;
        let target = select_entity(&mut tx, tenant, &relation.target_id, false)
            .await?
            .ok_or_else(|| Error::EntityNotFound(relation.target_id.clone()))?;
        validate_relation(&relation, &source, &target)?;

        sqlx::query(
            "INSERT INTO strata_relations \
             (tenant_id, id, relation_type, source_id, target_id, data) \
             VALUES ($1, $2, $3, $4, $5, $6::json)",
        )
        .bind(tenant)
        .bind(&relation.id)
        .bind(&relation.relation_type)
        .bind(&relation.source_id)
        .bind(&relation.target_id)
        .bind(serde_json::to_string(&relation)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::from(Error::RelationExists(relation.id.clone()))
            } else {
                StorageError::from(e)
            }
        })?;
        tx.commit().await?;
        Ok(relation)
    }

    async fn fetch_relation(
        &self,
        id: &str,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Option<Relation>> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT data FROM strata_relations WHERE tenant_id = $1 AND id = $2")
            .bind(scope.unwrap_or_default())
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(|r| decode::<Relation>(&r, 0)).transpose()
    }

    async fn remove_relation(&self, id: &str, ctx: Option<&TenantContext>) -> StorageResult<()> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Err(Error::RelationNotFound(id.to_string()).into());
        };
        let changed = sqlx::query("DELETE FROM strata_relations WHERE tenant_id = $1 AND id = $2")
            .bind(scope.unwrap_or_default())
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if changed == 0 {
            return Err(Error::RelationNotFound(id.to_string()).into());
        }
        Ok(())
    }

    async fn select_entities(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Vec<Entity>> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(Vec::new());
        };

        let mut sql = String::from("SELECT data FROM strata_entities WHERE tenant_id = $1");
        let mut values = vec![scope.unwrap_or_default().to_string()];
        if let Some(entity_type) = &query.entity_type {
            values.push(entity_type.clone());
            sql.push_str(&format!(" AND entity_type = ${}", values.len()));
        }
        sql.push_str(" ORDER BY id");
        sql.push_str(&limit_clause(query));

        let rows = bind_all(sqlx::query(&sql), &values).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let entities = rows
            .iter()
            .map(|r| decode::<Entity>(r, 0))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(query.finish_entities(entities))
    }

    async fn select_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Vec<Relation>> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(Vec::new());
        };

        let mut sql = String::from("SELECT data FROM strata_relations WHERE tenant_id = $1");
        let mut values = vec![scope.unwrap_or_default().to_string()];
        let filters = [
            ("relation_type", &query.relation_type),
            ("source_id", &query.source_id),
            ("target_id", &query.target_id),
        ];
        for (column, value) in filters {
            if let Some(value) = value {
                values.push(value.clone());
                sql.push_str(&format!(" AND {} = ${}", column, values.len()));
            }
        }
        sql.push_str(" ORDER BY seq");
        sql.push_str(&limit_clause(query));

        let rows = bind_all(sqlx::query(&sql), &values).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let relations = rows
            .iter()
            .map(|r| decode::<Relation>(r, 0))
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(query.finish_relations(relations))
    }

    async fn neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> StorageResult<Vec<(Relation, Entity)>> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(Vec::new());
        };

        let sides: &[(&str, &str)] = match direction {
            Direction::Outgoing => &[("source_id", "target_id")],
            Direction::Incoming => &[("target_id", "source_id")],
            Direction::Both => &[("source_id", "target_id"), ("target_id", "source_id")],
        };

        let mut edges = Vec::new();
        let mut seen = HashSet::new();
        for (anchor, far) in sides {
            let sql = format!(
                "SELECT r.data, e.data FROM strata_relations r \
                 JOIN strata_entities e ON e.tenant_id = r.tenant_id AND e.id = r.{far} \
                 WHERE r.tenant_id = $1 AND r.{anchor} = $2 \
                 AND (cardinality($3::text[]) = 0 OR r.relation_type = ANY($3)) \
                 ORDER BY r.seq"
            );
            let rows = sqlx::query(&sql)
                .bind(scope.unwrap_or_default())
                .bind(entity_id)
                .bind(relation_types)
                .fetch_all(&mut *tx)
                .await?;
            for row in &rows {
                let relation: Relation = decode(row, 0)?;
                if seen.insert(relation.id.clone()) {
                    edges.push((relation, decode(row, 1)?));
                }
            }
        }
        tx.commit().await?;
        Ok(edges)
    }

    async fn embedded_entities(&self, ctx: Option<&TenantContext>) -> StorageResult<Vec<Entity>> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(Vec::new());
        };
        let rows =
            sqlx::query("SELECT data FROM strata_entities WHERE tenant_id = $1 AND has_embedding")
                .bind(scope.unwrap_or_default())
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;
        rows.iter().map(|r| decode::<Entity>(r, 0)).collect()
    }

    async fn count(&self, table: &str, ctx: Option<&TenantContext>) -> StorageResult<usize> {
        let scope = scope_of(ctx);
        let Some(mut tx) = self.begin_scoped(scope, false).await? else {
            return Ok(0);
        };
        let sql = format!("SELECT COUNT(*) FROM {} WHERE tenant_id = $1", table);
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(scope.unwrap_or_default())
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(count as usize)
    }

    async fn owner_of(&self, entity_id: &str) -> StorageResult<Option<String>> {
        if !self.separate() {
            // Under row-level security only the owner index is visible
            // across tenants
            let sql = if self.row_security() {
                "SELECT tenant_id FROM strata_entity_owners \
                 WHERE id = $1 AND tenant_id <> '' ORDER BY tenant_id LIMIT 1"
            } else {
                "SELECT tenant_id FROM strata_entities \
                 WHERE id = $1 AND tenant_id <> '' ORDER BY tenant_id LIMIT 1"
            };
            let owner: Option<String> = sqlx::query_scalar(sql)
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
            return Ok(owner);
        }

        let schemas: Vec<String> = sqlx::query_scalar(
            "SELECT nspname::text FROM pg_namespace \
             WHERE starts_with(nspname, $1) ORDER BY nspname",
        )
        .bind(PARTITION_PREFIX)
        .fetch_all(&self.pool)
        .await?;

        for schema in schemas {
            let Some(tenant) = schema.strip_prefix(PARTITION_PREFIX) else {
                continue;
            };
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM {}.strata_entities WHERE id = $1)",
                quote_ident(&schema)
            );
            match sqlx::query_scalar::<_, bool>(&sql)
                .bind(entity_id)
                .fetch_one(&self.pool)
                .await
            {
                Ok(true) => return Ok(Some(tenant.to_string())),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(schema = %schema, error = %e, "Skipping schema in owner lookup")
                }
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for PostgresGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresGraphStore")
            .field("isolation", &self.isolation)
            .field("enable_rls", &self.enable_rls)
            .field("cascade", &self.cascade)
            .finish_non_exhaustive()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn decode<T: serde::de::DeserializeOwned>(row: &PgRow, index: usize) -> StorageResult<T> {
    let Json(value) = row.try_get::<Json<T>, _>(index)?;
    Ok(value)
}

fn limit_clause(query: &GraphQuery) -> String {
    match query.limit {
        Some(limit) if !query.has_predicates() => format!(" LIMIT {}", limit),
        _ => String::new(),
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    values: &'q [String],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for value in values {
        query = query.bind(value.as_str());
    }
    query
}

async fn select_entity(
    conn: &mut PgConnection,
    tenant: &str,
    id: &str,
    for_update: bool,
) -> StorageResult<Option<Entity>> {
    let sql = if for_update {
        "SELECT data FROM strata_entities WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
    } else {
        "SELECT data FROM strata_entities WHERE tenant_id = $1 AND id = $2"
    };
    let row = sqlx::query(sql)
        .bind(tenant)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| decode::<Entity>(&r, 0)).transpose()
}

/// Serialize schema creation and migration for one schema across sessions
async fn lock_schema(conn: &mut PgConnection, schema: &str) -> StorageResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("strata_migrate:{}", schema))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Entity and relation documents are stored as `JSON` rather than `JSONB`
/// so numbers keep their written form (`1e18` stays a float)
fn migration_sql(version: u32, prefix: &str) -> StorageResult<String> {
    let sql = match version {
        1 => format!(
            r#"
            CREATE TABLE IF NOT EXISTS {prefix}strata_entities (
                tenant_id TEXT NOT NULL DEFAULT '',
                id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                data JSON NOT NULL,
                PRIMARY KEY (tenant_id, id)
            );

            CREATE TABLE IF NOT EXISTS {prefix}strata_relations (
                tenant_id TEXT NOT NULL DEFAULT '',
                id TEXT NOT NULL,
                seq BIGSERIAL,
                relation_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                data JSON NOT NULL,
                PRIMARY KEY (tenant_id, id)
            );

            CREATE INDEX IF NOT EXISTS strata_entities_type_idx ON {prefix}strata_entities (tenant_id, entity_type);
            CREATE INDEX IF NOT EXISTS strata_relations_source_idx ON {prefix}strata_relations (tenant_id, source_id);
            CREATE INDEX IF NOT EXISTS strata_relations_target_idx ON {prefix}strata_relations (tenant_id, target_id);
            CREATE INDEX IF NOT EXISTS strata_relations_type_idx ON {prefix}strata_relations (tenant_id, relation_type);
            "#
        ),
        2 => format!(
            r#"
            ALTER TABLE {prefix}strata_entities ADD COLUMN IF NOT EXISTS has_embedding BOOLEAN
                GENERATED ALWAYS AS (coalesce(json_typeof(data->'embedding') = 'array', false)) STORED;
            CREATE INDEX IF NOT EXISTS strata_entities_embedding_idx ON {prefix}strata_entities (tenant_id) WHERE has_embedding;
            CREATE INDEX IF NOT EXISTS strata_entities_id_idx ON {prefix}strata_entities (id);
            "#
        ),
        other => {
            return Err(StorageError::Migration(format!(
                "No migration defined for schema version {}",
                other
            )))
        }
    };
    Ok(sql)
}

/// Bring one schema (`None` = the connection's default) to the current
/// version. Serialized across processes with an advisory lock.
async fn migrate(conn: &mut PgConnection, schema: Option<&str>) -> StorageResult<()> {
    let prefix = schema.map(|s| format!("{}.", quote_ident(s))).unwrap_or_default();

    lock_schema(&mut *conn, schema.unwrap_or("public")).await?;
    (&mut *conn)
        .execute(sqlx::raw_sql(&format!(
            "CREATE TABLE IF NOT EXISTS {prefix}strata_schema_version (version INTEGER NOT NULL)"
        )))
        .await?;

    let current: i32 = sqlx::query_scalar(&format!(
        "SELECT COALESCE(MAX(version), 0) FROM {prefix}strata_schema_version"
    ))
    .fetch_one(&mut *conn)
    .await?;
    let current = current.max(0) as u32;

    if current >= CURRENT_VERSION {
        tracing::debug!(schema = ?schema, "Schema already at version {}", current);
        return Ok(());
    }

    tracing::info!(
        schema = ?schema,
        "Migrating schema from v{} to v{}",
        current,
        CURRENT_VERSION
    );
    for version in (current + 1)..=CURRENT_VERSION {
        (&mut *conn)
            .execute(sqlx::raw_sql(&migration_sql(version, &prefix)?))
            .await?;
        sqlx::query(&format!(
            "INSERT INTO {prefix}strata_schema_version (version) VALUES ($1)"
        ))
        .bind(version as i32)
        .execute(&mut *conn)
        .await?;
        tracing::info!(
            schema = ?schema,
            "Migrated to schema version {} ({})",
            version,
            describe(version).unwrap_or("undocumented")
        );
    }
    Ok(())
}

#[async_trait]
impl GraphStore for PostgresGraphStore {
    async fn initialize(&self) -> Result<()> {
        if !self.separate() {
            let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
            migrate(&mut tx, None).await?;
            tx.commit().await.map_err(StorageError::from)?;
            if self.row_security() {
                self.apply_rls().await?;
            }
        }
        tracing::info!("Initialized PostgreSQL graph store");
        self.metrics.on_open(BACKEND);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("Closed PostgreSQL graph store");
        self.metrics.on_close(BACKEND);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(true)
    }

    // Entity operations

    async fn add_entity(&self, entity: Entity, ctx: Option<&TenantContext>) -> Result<Entity> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "add_entity");
        timer.finish(self.insert_entity(entity, ctx).await.map_err(Into::into))
    }

    async fn get_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<Option<Entity>> {
        Ok(self.fetch_entity(id, ctx).await?)
    }

    async fn update_entity(
        &self,
        id: &str,
        update: EntityUpdate,
        ctx: Option<&TenantContext>,
    ) -> Result<Entity> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "update_entity");
        timer.finish(self.modify_entity(id, update, ctx).await.map_err(Into::into))
    }

    async fn delete_entity(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        let timer = OperationTimer::start(self.metrics.as_ref(), BACKEND, "delete_entity");
        timer.finish(self.remove_entity(id, ctx).await.map_err(Into::into))
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
        let result = match self.insert_relation(relation.clone(), ctx).await.map_err(Error::from) {
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
        Ok(self.fetch_relation(id, ctx).await?)
    }

    async fn delete_relation(&self, id: &str, ctx: Option<&TenantContext>) -> Result<()> {
        Ok(self.remove_relation(id, ctx).await?)
    }

    // Queries

    async fn query(&self, query: &GraphQuery, ctx: Option<&TenantContext>) -> Result<Vec<Entity>> {
        Ok(self.select_entities(query, ctx).await?)
    }

    async fn query_relations(
        &self,
        query: &GraphQuery,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<Relation>> {
        Ok(self.select_relations(query, ctx).await?)
    }

    async fn owning_tenant(&self, entity_id: &str) -> Result<Option<String>> {
        Ok(self.owner_of(entity_id).await?)
    }

    // Graph operations

    async fn get_neighbor_edges(
        &self,
        entity_id: &str,
        direction: Direction,
        relation_types: &[String],
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<(Relation, Entity)>> {
        Ok(self
            .neighbor_edges(entity_id, direction, relation_types, ctx)
            .await?)
    }

    async fn vector_search(
        &self,
        embedding: &[f32],
        max_results: usize,
        ctx: Option<&TenantContext>,
    ) -> Result<Vec<VectorMatch>> {
        let candidates = self.embedded_entities(ctx).await?;
        Ok(rank_by_similarity(embedding, candidates, max_results))
    }

    async fn count_entities(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        Ok(self.count("strata_entities", ctx).await?)
    }

    async fn count_relations(&self, ctx: Option<&TenantContext>) -> Result<usize> {
        Ok(self.count("strata_relations", ctx).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("tenant_acme"), "\"tenant_acme\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_schema_names() {
        assert_eq!(PostgresGraphStore::schema_name(Some("acme")), "tenant_acme");
        assert_eq!(PostgresGraphStore::schema_name(None), GLOBAL_SCHEMA);
    }

    #[test]
    fn test_migrations_are_schema_qualified() {
        let sql = migration_sql(1, "\"tenant_acme\".").unwrap();
        assert!(sql.contains("\"tenant_acme\".strata_entities"));
        assert!(sql.contains("\"tenant_acme\".strata_relations"));
        assert!(migration_sql(CURRENT_VERSION + 1, "").is_err());
    }

    #[test]
    fn test_documents_are_stored_verbatim() {
        let sql = migration_sql(1, "").unwrap();
        assert!(sql.contains("data JSON NOT NULL"));
        assert!(!sql.contains("JSONB"));
        assert!(migration_sql(2, "").unwrap().contains("json_typeof"));
    }

    #[test]
    fn test_owner_index_holds_no_entity_data() {
        assert!(OWNER_INDEX_SQL.contains("CREATE TABLE IF NOT EXISTS strata_entity_owners"));
        assert!(!OWNER_INDEX_SQL.contains("data JSON"));
        assert!(!OWNER_INDEX_SQL.contains("CREATE POLICY"));
    }

    #[test]
    fn test_limit_pushdown_only_without_predicates() {
        assert_eq!(limit_clause(&GraphQuery::new().with_limit(5)), " LIMIT 5");
        assert_eq!(
            limit_clause(&GraphQuery::new().where_exists("name").with_limit(5)),
            ""
        );
    }
}
