use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    PgConnection, Row,
    postgres::{PgPool, PgPoolOptions, PgRow},
};
use tracing::{debug, error, info, warn};

use syncstore_core::{
    backend::{StorageBackend, StorageBackendBuilder},
    error::{StorageError, StorageResult},
    id::{IdGenerator, IdGeneratorRef, assign_id, uuid_generator, validate_generator},
    page::Page,
    query::{Filter, FilterVisitor, ListQuery},
    record::{DELETED_FIELD, ID_FIELD, MODIFIED_FIELD, Record, Scope},
    timestamp::{Clock, ClockRef, system_clock},
    unicity::{WriteKind, unicity_rules},
};

use crate::sql::{FilterCompiler, SqlParam, SqlParams, order_by};

const COLUMNS: &str = "id, last_modified, deleted, data";

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id TEXT NOT NULL,
        owner_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        last_modified BIGINT NOT NULL,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        data JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (id, owner_id, collection_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_records_scope_last_modified
        ON records (owner_id, collection_id, last_modified)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS timestamps (
        owner_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        last_modified BIGINT NOT NULL,
        PRIMARY KEY (owner_id, collection_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

/// Takes the row lock of the scope timestamp and moves it forward. Running it first in
/// a write transaction serializes the writers of a scope until they commit.
const BUMP_TIMESTAMP: &str = r#"
    INSERT INTO timestamps (owner_id, collection_id, last_modified)
    VALUES ($1, $2, $3)
    ON CONFLICT (owner_id, collection_id) DO UPDATE
        SET last_modified = GREATEST(EXCLUDED.last_modified, timestamps.last_modified + 1)
    RETURNING last_modified
"#;

fn backend(err: sqlx::Error) -> StorageError {
    error!(error = %err, "PostgreSQL operation failed");
    StorageError::backend(err)
}

fn scope_condition(scope: &Scope, params: &mut SqlParams) -> String {
    format!(
        "owner_id = {} AND collection_id = {}",
        params.push(SqlParam::Text(scope.owner_id.clone())),
        params.push(SqlParam::Text(scope.collection_id.clone())),
    )
}

fn row_to_record(row: &PgRow) -> StorageResult<Record> {
    let id: String = row.try_get("id").map_err(backend)?;
    let last_modified: i64 = row.try_get("last_modified").map_err(backend)?;
    let deleted: bool = row.try_get("deleted").map_err(backend)?;

    if deleted {
        return Ok(Record::tombstone(id, last_modified));
    }

    let data: Value = row.try_get("data").map_err(backend)?;
    let mut record = Record::from_value(data)?;
    record.set_id(id);
    record.set_last_modified(last_modified);
    Ok(record)
}

/// The JSONB body of a record, without the fields stored in their own columns.
fn record_data(record: &Record) -> Value {
    let mut data = record.as_map().clone();
    for field in [ID_FIELD, MODIFIED_FIELD, DELETED_FIELD] {
        data.remove(field);
    }
    Value::Object(data)
}

/// PostgreSQL-backed record storage.
///
/// Records and tombstones share the `records` table, keyed by
/// `(id, owner_id, collection_id)`, with their body in a JSONB column. Collection
/// timestamps live in the `timestamps` table. Listing, filtering and unicity checks
/// run as SQL queries.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
    clock: ClockRef,
    id_generator: IdGeneratorRef,
    readonly: bool,
}

impl PostgresStore {
    /// Wraps an existing pool, with the system clock and UUID ids.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: system_clock(),
            id_generator: uuid_generator(),
            readonly: false,
        }
    }

    pub fn builder(database_url: &str) -> PostgresStoreBuilder {
        PostgresStoreBuilder::new(database_url)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.readonly {
            return Err(StorageError::Readonly(
                "PostgreSQL store is read-only".to_string(),
            ));
        }
        Ok(())
    }

    async fn bump(&self, conn: &mut PgConnection, scope: &Scope) -> StorageResult<i64> {
        sqlx::query_scalar::<_, i64>(BUMP_TIMESTAMP)
            .bind(&scope.owner_id)
            .bind(&scope.collection_id)
            .bind(self.clock.now_millis())
            .fetch_one(&mut *conn)
            .await
            .map_err(backend)
    }

    /// Looks for a live record colliding with `record`, one unique field at a time.
    async fn check_unicity(
        &self,
        conn: &mut PgConnection,
        scope: &Scope,
        record: &Record,
        unique_fields: &[String],
        kind: WriteKind,
    ) -> StorageResult<()> {
        for rule in unicity_rules(record, unique_fields, kind) {
            let mut params = SqlParams::new();
            let scope_sql = scope_condition(scope, &mut params);
            let rule_sql = FilterCompiler::new(&mut params).visit_all(&rule.filters)?;
            let sql = format!(
                "SELECT {COLUMNS} FROM records WHERE {scope_sql} AND NOT deleted AND {rule_sql} \
                 ORDER BY id COLLATE \"C\" LIMIT 1"
            );

            let existing = params
                .bind(sqlx::query(&sql))
                .fetch_optional(&mut *conn)
                .await
                .map_err(backend)?;

            if let Some(row) = existing {
                return Err(StorageError::unicity(rule.field, row_to_record(&row)?));
            }
        }
        Ok(())
    }

    async fn fetch_live(
        &self,
        conn: &mut PgConnection,
        scope: &Scope,
        id: &str,
    ) -> StorageResult<Option<Record>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM records \
             WHERE owner_id = $1 AND collection_id = $2 AND id = $3 AND NOT deleted"
        ))
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(backend)?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn heartbeat(&self) -> StorageResult<()> {
        if self.readonly {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            return Ok(());
        }

        let now = self.clock.now_millis().to_string();
        sqlx::query(
            "INSERT INTO metadata (name, value) VALUES ('heartbeat', $1) \
             ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let stored: String =
            sqlx::query_scalar("SELECT value FROM metadata WHERE name = 'heartbeat'")
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;

        if stored != now {
            debug!(%stored, %now, "heartbeat overwritten concurrently");
        }
        Ok(())
    }

    /// Closes every connection of the pool.
    pub async fn shutdown(self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PostgresStore {
    async fn initialize_schema(&self) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        // Concurrent `CREATE TABLE IF NOT EXISTS` may still collide on the catalog.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('syncstore_schema'))")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)?;
        info!("PostgreSQL schema initialized");
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.ensure_writable()?;
        sqlx::query("TRUNCATE records, timestamps")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        debug!("PostgreSQL store flushed");
        Ok(())
    }

    async fn ping(&self) -> bool {
        match self.heartbeat().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "PostgreSQL health check failed");
                false
            }
        }
    }

    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT last_modified FROM timestamps WHERE owner_id = $1 AND collection_id = $2",
        )
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        if let Some(timestamp) = current {
            return Ok(timestamp);
        }

        self.ensure_writable()?;
        // A concurrent initialization wins; the no-op update returns its value.
        sqlx::query_scalar(
            "INSERT INTO timestamps (owner_id, collection_id, last_modified) VALUES ($1, $2, $3) \
             ON CONFLICT (owner_id, collection_id) DO UPDATE \
             SET last_modified = timestamps.last_modified \
             RETURNING last_modified",
        )
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .bind(self.clock.now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(backend)
    }

    async fn create(
        &self,
        scope: &Scope,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        self.ensure_writable()?;

        let mut record = record;
        record.strip_storage_fields();
        assign_id(&mut record, self.id_generator.as_ref())?;
        let id = record.id().unwrap_or_default().to_string();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let timestamp = self.bump(&mut tx, scope).await?;
        self.check_unicity(&mut tx, scope, &record, unique_fields, WriteKind::Create)
            .await?;

        // Only a tombstone may be overwritten: a live row with a generated id is a collision.
        let inserted = sqlx::query(
            "INSERT INTO records (id, owner_id, collection_id, last_modified, deleted, data) \
             VALUES ($1, $2, $3, $4, FALSE, $5) \
             ON CONFLICT (id, owner_id, collection_id) DO UPDATE \
             SET last_modified = EXCLUDED.last_modified, deleted = FALSE, data = EXCLUDED.data \
             WHERE records.deleted",
        )
        .bind(&id)
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .bind(timestamp)
        .bind(record_data(&record))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            let existing = self
                .fetch_live(&mut tx, scope, &id)
                .await?
                .ok_or_else(|| StorageError::backend_message(format!("record {id} vanished")))?;
            return Err(StorageError::unicity(ID_FIELD, existing));
        }

        tx.commit().await.map_err(backend)?;

        record.set_last_modified(timestamp);
        debug!(%scope, %id, timestamp, "record created");
        Ok(record)
    }

    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        let mut conn = self.pool.acquire().await.map_err(backend)?;
        self.fetch_live(&mut conn, scope, id)
            .await?
            .ok_or_else(|| StorageError::RecordNotFound(id.to_string()))
    }

    async fn update(
        &self,
        scope: &Scope,
        id: &str,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        self.ensure_writable()?;

        let mut record = record;
        record.strip_storage_fields();
        record.set_id(id);

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let timestamp = self.bump(&mut tx, scope).await?;
        self.check_unicity(&mut tx, scope, &record, unique_fields, WriteKind::Update)
            .await?;

        sqlx::query(
            "INSERT INTO records (id, owner_id, collection_id, last_modified, deleted, data) \
             VALUES ($1, $2, $3, $4, FALSE, $5) \
             ON CONFLICT (id, owner_id, collection_id) DO UPDATE \
             SET last_modified = EXCLUDED.last_modified, deleted = FALSE, data = EXCLUDED.data",
        )
        .bind(id)
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .bind(timestamp)
        .bind(record_data(&record))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;

        record.set_last_modified(timestamp);
        debug!(%scope, %id, timestamp, "record updated");
        Ok(record)
    }

    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        self.ensure_writable()?;

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let timestamp = self.bump(&mut tx, scope).await?;

        let deleted = sqlx::query(
            "UPDATE records SET deleted = TRUE, data = '{}'::jsonb, last_modified = $4 \
             WHERE owner_id = $1 AND collection_id = $2 AND id = $3 AND NOT deleted",
        )
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .bind(id)
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        if deleted.rows_affected() == 0 {
            // Dropping the transaction rolls the timestamp back.
            return Err(StorageError::RecordNotFound(id.to_string()));
        }
        tx.commit().await.map_err(backend)?;

        debug!(%scope, %id, timestamp, "record deleted");
        Ok(Record::tombstone(id, timestamp))
    }

    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        self.ensure_writable()?;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        // No timestamp row means the scope was never written.
        let locked: Option<i64> = sqlx::query_scalar(
            "SELECT last_modified FROM timestamps \
             WHERE owner_id = $1 AND collection_id = $2 FOR UPDATE",
        )
        .bind(&scope.owner_id)
        .bind(&scope.collection_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        if locked.is_none() {
            return Ok(Vec::new());
        }

        let mut params = SqlParams::new();
        let scope_sql = scope_condition(scope, &mut params);
        let filters_sql = FilterCompiler::new(&mut params).visit_all(filters)?;
        let sql = format!(
            "SELECT id FROM records WHERE {scope_sql} AND NOT deleted AND {filters_sql} \
             ORDER BY id COLLATE \"C\""
        );
        let victims: Vec<String> = params
            .bind(sqlx::query(&sql))
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(backend)?;

        let mut tombstones = Vec::with_capacity(victims.len());
        for id in victims {
            let timestamp = self.bump(&mut tx, scope).await?;
            sqlx::query(
                "UPDATE records SET deleted = TRUE, data = '{}'::jsonb, last_modified = $4 \
                 WHERE owner_id = $1 AND collection_id = $2 AND id = $3",
            )
            .bind(&scope.owner_id)
            .bind(&scope.collection_id)
            .bind(&id)
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
            tombstones.push(Record::tombstone(id, timestamp));
        }

        tx.commit().await.map_err(backend)?;

        debug!(%scope, deleted = tombstones.len(), "records deleted");
        Ok(tombstones)
    }

    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        // Both statements see the same snapshot.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let mut params = SqlParams::new();
        let scope_sql = scope_condition(scope, &mut params);
        let filters_sql = FilterCompiler::new(&mut params).visit_all(&query.filters)?;
        let count_sql = format!(
            "SELECT COUNT(*) FROM records WHERE {scope_sql} AND NOT deleted AND {filters_sql}"
        );
        let total_count: i64 = params
            .bind(sqlx::query(&count_sql))
            .fetch_one(&mut *tx)
            .await
            .map_err(backend)?
            .try_get(0)
            .map_err(backend)?;

        let mut params = SqlParams::new();
        let mut conditions = vec![
            scope_condition(scope, &mut params),
            FilterCompiler::new(&mut params).visit_all(&query.filters)?,
        ];
        if !query.include_deleted {
            conditions.push("NOT deleted".to_string());
        }
        if !query.pagination_rules.is_empty() {
            conditions.push(FilterCompiler::new(&mut params).visit_any(&query.pagination_rules)?);
        }

        let mut sql = format!(
            "SELECT {COLUMNS} FROM records WHERE {} {}",
            conditions.join(" AND "),
            order_by(&query.sorting)
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let records = params
            .bind(sqlx::query(&sql))
            .fetch_all(&mut *tx)
            .await
            .map_err(backend)?
            .iter()
            .map(row_to_record)
            .collect::<StorageResult<Vec<_>>>()?;

        tx.commit().await.map_err(backend)?;

        Ok(Page::new(records, usize::try_from(total_count).unwrap_or_default()))
    }

    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize> {
        self.ensure_writable()?;

        let mut params = SqlParams::new();
        let mut sql = format!(
            "DELETE FROM records WHERE {} AND deleted",
            scope_condition(scope, &mut params)
        );
        if let Some(before) = before {
            sql.push_str(&format!(
                " AND last_modified < {}",
                params.push(SqlParam::BigInt(before))
            ));
        }

        let purged = params
            .bind(sqlx::query(&sql))
            .execute(&self.pool)
            .await
            .map_err(backend)?
            .rows_affected();

        debug!(%scope, purged, "tombstones purged");
        Ok(usize::try_from(purged).unwrap_or(usize::MAX))
    }

    async fn shutdown(self) -> StorageResult<()> {
        PostgresStore::shutdown(self).await
    }
}

/// Builder for constructing [`PostgresStore`] instances.
///
/// # Example
///
/// ```ignore
/// use syncstore_postgres::PostgresStore;
///
/// let store = PostgresStore::builder("postgres://localhost/syncstore")
///     .max_connections(10)
///     .acquire_timeout(Duration::from_secs(5))
///     .build()
///     .await?;
/// ```
pub struct PostgresStoreBuilder {
    database_url: String,
    max_connections: u32,
    acquire_timeout: Duration,
    lazy: bool,
    clock: Option<ClockRef>,
    id_generator: Option<IdGeneratorRef>,
    readonly: bool,
}

impl PostgresStoreBuilder {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
            lazy: false,
            clock: None,
            id_generator: None,
            readonly: false,
        }
    }

    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Bounds how long an operation waits for a connection before failing.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Opens connections on first use instead of at build time.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn with_id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

#[async_trait]
impl StorageBackendBuilder for PostgresStoreBuilder {
    type Backend = PostgresStore;

    async fn build(self) -> StorageResult<Self::Backend> {
        let id_generator = self.id_generator.unwrap_or_else(uuid_generator);
        validate_generator(id_generator.as_ref())?;

        let options = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout);
        let connected = match self.lazy {
            true => options.connect_lazy(&self.database_url),
            false => options.connect(&self.database_url).await,
        };
        let pool = connected
            .map_err(|e| StorageError::Initialization(format!("failed to connect postgres: {e}")))?;

        Ok(PostgresStore {
            pool,
            clock: self.clock.unwrap_or_else(system_clock),
            id_generator,
            readonly: self.readonly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn lazy_store(readonly: bool) -> PostgresStore {
        PostgresStore::builder("postgres://localhost:1/syncstore")
            .lazy(true)
            .acquire_timeout(Duration::from_millis(200))
            .readonly(readonly)
            .build()
            .await
            .unwrap()
    }

    #[test]
    fn record_data_leaves_storage_fields_to_columns() {
        let record = Record::from_value(json!({
            "id": "abc",
            "last_modified": 42,
            "title": "Hello",
            "meta": {"a.b": 1},
        }))
        .unwrap();

        assert_eq!(
            record_data(&record),
            json!({"title": "Hello", "meta": {"a.b": 1}})
        );
    }

    #[tokio::test]
    async fn readonly_store_rejects_writes_without_connecting() {
        let store = lazy_store(true).await;
        let scope = Scope::new("articles", "alice");

        let err = store.create(&scope, Record::new(), &[]).await.unwrap_err();
        assert!(matches!(err, StorageError::Readonly(_)));

        let err = store.purge_deleted(&scope, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Readonly(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_backend_error() {
        let store = lazy_store(false).await;
        let scope = Scope::new("articles", "alice");

        let err = store.get(&scope, "abc").await.unwrap_err();

        assert!(err.is_backend());
        assert!(!store.ping().await);
    }
}
