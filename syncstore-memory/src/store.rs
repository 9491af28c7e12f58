//! In-memory storage implementation.
//!
//! Records and tombstones of each scope live in a HashMap keyed by id, next to the
//! scope's collection timestamp. A single async-aware read-write lock guards all
//! scopes: every write holds it for the whole read-check-bump-store sequence, which
//! makes timestamp assignment and unicity checks atomic.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use mea::rwlock::RwLock;
use tracing::debug;

use syncstore_core::{
    backend::{StorageBackend, StorageBackendBuilder},
    error::{StorageError, StorageResult},
    evaluator::apply_filters,
    id::{IdGenerator, IdGeneratorRef, assign_id, uuid_generator, validate_generator},
    page::Page,
    pagination::extract_record_set,
    query::{Filter, ListQuery},
    record::{Record, Scope},
    timestamp::{Clock, ClockRef, next_timestamp, system_clock},
    unicity::{WriteKind, check_unicity},
};

/// Records (tombstones included) and timestamp of one scope.
#[derive(Debug, Default)]
struct ScopeState {
    records: HashMap<String, Record>,
    timestamp: Option<i64>,
}

impl ScopeState {
    fn bump(&mut self, clock: &dyn Clock) -> i64 {
        let timestamp = next_timestamp(self.timestamp, clock.now_millis());
        self.timestamp = Some(timestamp);
        timestamp
    }

    fn live(&self, id: &str) -> Option<&Record> {
        self.records.get(id).filter(|record| !record.is_deleted())
    }
}

type StoreMap = HashMap<Scope, ScopeState>;

/// Thread-safe in-memory record storage backend.
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing it to
/// be shared across async tasks. Clones share the same data.
///
/// # Performance
///
/// Listing scans every record of the scope (no indexing).
///
/// # Example
///
/// ```ignore
/// use syncstore_memory::InMemoryStore;
/// use syncstore_core::backend::StorageBackend;
///
/// let store = InMemoryStore::new();
/// let scope = Scope::new("articles", "alice");
/// let created = store.create(&scope, Record::new(), &[]).await?;
/// assert_eq!(store.get(&scope, created.id().unwrap()).await?, created);
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    /// scope -> (record id -> record or tombstone, collection timestamp)
    store: Arc<RwLock<StoreMap>>,
    clock: ClockRef,
    id_generator: IdGeneratorRef,
    readonly: bool,
}

impl InMemoryStore {
    /// Creates a new empty, writable store using the system clock and UUID ids.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
            clock: system_clock(),
            id_generator: uuid_generator(),
            readonly: false,
        }
    }

    /// Creates a builder for constructing an `InMemoryStore` with custom options.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.readonly {
            return Err(StorageError::Readonly(
                "in-memory store is read-only".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryStore {
    async fn initialize_schema(&self) -> StorageResult<()> {
        debug!("in-memory store needs no schema");
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.ensure_writable()?;
        self.store.write().await.clear();
        debug!("in-memory store flushed");
        Ok(())
    }

    /// The in-process store is always available.
    async fn ping(&self) -> bool {
        true
    }

    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64> {
        if let Some(timestamp) = self
            .store
            .read()
            .await
            .get(scope)
            .and_then(|state| state.timestamp)
        {
            return Ok(timestamp);
        }

        self.ensure_writable()?;
        let mut store = self.store.write().await;
        let state = store.entry(scope.clone()).or_default();

        Ok(*state
            .timestamp
            .get_or_insert_with(|| self.clock.now_millis()))
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

        let mut store = self.store.write().await;
        let state = store.entry(scope.clone()).or_default();

        check_unicity(state.records.values(), &record, unique_fields, WriteKind::Create)?;

        let timestamp = state.bump(self.clock.as_ref());
        record.set_last_modified(timestamp);

        let id = record.id().unwrap_or_default().to_string();
        debug!(%scope, %id, timestamp, "record created");
        state.records.insert(id, record.clone());

        Ok(record)
    }

    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        self.store
            .read()
            .await
            .get(scope)
            .and_then(|state| state.live(id))
            .cloned()
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

        let mut store = self.store.write().await;
        let state = store.entry(scope.clone()).or_default();

        check_unicity(state.records.values(), &record, unique_fields, WriteKind::Update)?;

        let timestamp = state.bump(self.clock.as_ref());
        record.set_last_modified(timestamp);

        debug!(%scope, %id, timestamp, "record updated");
        state.records.insert(id.to_string(), record.clone());

        Ok(record)
    }

    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        self.ensure_writable()?;

        let mut store = self.store.write().await;
        let state = store
            .get_mut(scope)
            .filter(|state| state.live(id).is_some())
            .ok_or_else(|| StorageError::RecordNotFound(id.to_string()))?;

        let timestamp = state.bump(self.clock.as_ref());
        let tombstone = Record::tombstone(id, timestamp);

        debug!(%scope, %id, timestamp, "record deleted");
        state.records.insert(id.to_string(), tombstone.clone());

        Ok(tombstone)
    }

    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        self.ensure_writable()?;

        let mut store = self.store.write().await;
        let Some(state) = store.get_mut(scope) else {
            return Ok(Vec::new());
        };

        let live = state.records.values().filter(|record| !record.is_deleted());
        let mut victims: Vec<String> = apply_filters(live, filters)
            .into_iter()
            .filter_map(Record::id)
            .map(str::to_string)
            .collect();
        victims.sort();

        let mut tombstones = Vec::with_capacity(victims.len());
        for id in victims {
            let timestamp = state.bump(self.clock.as_ref());
            let tombstone = Record::tombstone(id.as_str(), timestamp);
            state.records.insert(id, tombstone.clone());
            tombstones.push(tombstone);
        }

        debug!(%scope, deleted = tombstones.len(), "records deleted");
        Ok(tombstones)
    }

    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page> {
        let store = self.store.read().await;
        let Some(state) = store.get(scope) else {
            return Ok(Page::default());
        };

        let (records, total_count) = extract_record_set(state.records.values(), query);
        Ok(Page::new(records, total_count))
    }

    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize> {
        self.ensure_writable()?;

        let mut store = self.store.write().await;
        let Some(state) = store.get_mut(scope) else {
            return Ok(0);
        };

        let count = state.records.len();
        state.records.retain(|_, record| {
            let expired = match before {
                Some(before) => record.last_modified().is_some_and(|ts| ts < before),
                None => true,
            };
            !(record.is_deleted() && expired)
        });
        let purged = count - state.records.len();

        debug!(%scope, purged, "tombstones purged");
        Ok(purged)
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use syncstore_memory::InMemoryStore;
/// use syncstore_core::{backend::StorageBackendBuilder, timestamp::ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// let store = InMemoryStore::builder()
///     .with_clock(clock.clone())
///     .build()
///     .await?;
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder {
    clock: Option<ClockRef>,
    id_generator: Option<IdGeneratorRef>,
    readonly: bool,
}

impl InMemoryStoreBuilder {
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn with_id_generator(mut self, generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    /// Rejects every write with [`StorageError::Readonly`].
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

#[async_trait]
impl StorageBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds a fresh store, after checking the id generator against its own format.
    async fn build(self) -> StorageResult<Self::Backend> {
        let id_generator = self.id_generator.unwrap_or_else(uuid_generator);
        validate_generator(id_generator.as_ref())?;

        Ok(InMemoryStore {
            store: Arc::new(RwLock::new(StoreMap::new())),
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
    use syncstore_core::timestamp::ManualClock;

    #[derive(Debug)]
    struct Sequential;

    impl IdGenerator for Sequential {
        fn generate(&self) -> String {
            "seq-1".to_string()
        }

        fn matches(&self, id: &str) -> bool {
            id.starts_with("seq-")
        }
    }

    #[derive(Debug)]
    struct Broken;

    impl IdGenerator for Broken {
        fn generate(&self) -> String {
            "oops".to_string()
        }

        fn matches(&self, _id: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn builder_rejects_inconsistent_generators() {
        let err = InMemoryStore::builder()
            .with_id_generator(Broken)
            .build()
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Initialization(_)));
    }

    #[tokio::test]
    async fn uses_the_configured_generator() {
        let store = InMemoryStore::builder()
            .with_id_generator(Sequential)
            .build()
            .await
            .unwrap();
        let scope = Scope::new("articles", "alice");

        let created = store.create(&scope, Record::new(), &[]).await.unwrap();

        assert_eq!(created.id(), Some("seq-1"));
    }

    #[tokio::test]
    async fn flush_forgets_records_and_timestamps() {
        let clock = ManualClock::new(100);
        let store = InMemoryStore::builder()
            .with_clock(clock.clone())
            .build()
            .await
            .unwrap();
        let scope = Scope::new("articles", "alice");
        let record = Record::from_value(json!({"title": "x"})).unwrap();
        store.create(&scope, record, &[]).await.unwrap();

        store.flush().await.unwrap();
        clock.set(50);

        assert_eq!(store.collection_timestamp(&scope).await.unwrap(), 50);
        assert!(store.get_all(&scope, &ListQuery::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn readonly_store_refuses_flush_but_answers_ping() {
        let store = InMemoryStore::builder().readonly(true).build().await.unwrap();

        assert!(matches!(store.flush().await, Err(StorageError::Readonly(_))));
        assert!(store.ping().await);
    }

    #[tokio::test]
    async fn clones_share_data() {
        let store = InMemoryStore::new();
        let other = store.clone();
        let scope = Scope::new("articles", "alice");

        let created = store.create(&scope, Record::new(), &[]).await.unwrap();

        assert_eq!(
            other.get(&scope, created.id().unwrap()).await.unwrap(),
            created
        );
    }
}
