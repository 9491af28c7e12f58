use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bson::{Bson, Document, de::deserialize_from_bson, doc, ser::serialize_to_bson};
use futures::TryStreamExt;
use mongodb::{
    Client, Collection as MongoCollection, Database, IndexModel,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::ClientOptions,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use syncstore_core::{
    backend::{StorageBackend, StorageBackendBuilder},
    error::{StorageError, StorageResult},
    evaluator::apply_filters,
    id::{IdGenerator, IdGeneratorRef, assign_id, uuid_generator, validate_generator},
    page::Page,
    pagination::extract_record_set,
    query::{Filter, ListQuery},
    record::{DELETED_FIELD, ID_FIELD, MODIFIED_FIELD, Record, Scope},
    timestamp::{CasPolicy, Clock, ClockRef, next_timestamp, system_clock},
    unicity::{WriteKind, check_unicity},
};

use crate::sanitizer::KeySanitizer;

const RECORDS: &str = "records";
const TIMESTAMPS: &str = "timestamps";
const HEARTBEAT: &str = "heartbeat";

const DUPLICATE_KEY: i32 = 11000;

fn scope_key(scope: &Scope) -> Document {
    doc! { "collection_id": scope.collection_id.as_str(), "owner_id": scope.owner_id.as_str() }
}

fn record_key(scope: &Scope, id: &str) -> Document {
    doc! { "collection_id": scope.collection_id.as_str(), "owner_id": scope.owner_id.as_str(), "id": id }
}

fn backend(err: MongoError) -> StorageError {
    StorageError::backend(err)
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

/// MongoDB used as a remote key/value store.
///
/// Each record or tombstone is one document keyed by `(collection_id, owner_id, id)`,
/// holding the record body with escaped keys. Each scope's collection timestamp is one
/// document keyed by `(collection_id, owner_id)`, bumped with a compare-and-swap loop:
/// read the current value, then update only if it is still that value. Filtering,
/// sorting and pagination run in process over the scope's records.
#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
    clock: ClockRef,
    id_generator: IdGeneratorRef,
    cas: CasPolicy,
    readonly: bool,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self {
            client,
            database,
            clock: system_clock(),
            id_generator: uuid_generator(),
            cas: CasPolicy::default(),
            readonly: false,
        }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn database(&self) -> Database {
        self.client.database(&self.database)
    }

    fn get_collection(&self, name: &str) -> MongoCollection<Document> {
        self.database().collection(name)
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.readonly {
            return Err(StorageError::Readonly(format!(
                "MongoDB database {} is read-only",
                self.database
            )));
        }
        Ok(())
    }

    fn prepare_document(&self, scope: &Scope, record: &Record) -> StorageResult<Document> {
        let id = record
            .id()
            .ok_or_else(|| StorageError::InvalidRecord("record without id".into()))?;
        let last_modified = record
            .last_modified()
            .ok_or_else(|| StorageError::InvalidRecord("record without timestamp".into()))?;

        let mut body = record.as_map().clone();
        for field in [ID_FIELD, MODIFIED_FIELD, DELETED_FIELD] {
            body.remove(field);
        }
        let data = serialize_to_bson(&Value::Object(body))?;

        Ok(doc! {
            "_id": record_key(scope, id),
            "collection_id": scope.collection_id.as_str(),
            "owner_id": scope.owner_id.as_str(),
            "last_modified": last_modified,
            "deleted": record.is_deleted(),
            "data": KeySanitizer::sanitize_value(&data),
        })
    }

    fn restore_document(&self, document: &Document) -> StorageResult<Record> {
        let id = document
            .get_document("_id")
            .and_then(|key| key.get_str("id"))
            .map_err(|e| StorageError::InvalidRecord(e.to_string()))?;
        let last_modified = document
            .get_i64("last_modified")
            .map_err(|e| StorageError::InvalidRecord(e.to_string()))?;

        if document.get_bool("deleted").unwrap_or(false) {
            return Ok(Record::tombstone(id, last_modified));
        }

        let data = document
            .get("data")
            .map(KeySanitizer::restore_value)
            .unwrap_or_else(|| Bson::Document(Document::new()));
        let mut record = Record::from_value(deserialize_from_bson::<Value>(data)?)?;
        record.set_id(id);
        record.set_last_modified(last_modified);

        Ok(record)
    }

    /// Loads the records of a scope, tombstones included on request.
    async fn load(&self, scope: &Scope, include_deleted: bool) -> StorageResult<Vec<Record>> {
        let mut filter = scope_key(scope);
        if !include_deleted {
            filter.insert("deleted", false);
        }

        self.get_collection(RECORDS)
            .find(filter)
            .await
            .map_err(backend)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend)?
            .iter()
            .map(|document| self.restore_document(document))
            .collect()
    }

    async fn store(&self, scope: &Scope, record: &Record) -> StorageResult<()> {
        let id = record.id().unwrap_or_default();

        self.get_collection(RECORDS)
            .replace_one(doc! { "_id": record_key(scope, id) }, self.prepare_document(scope, record)?)
            .upsert(true)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn read_timestamp(&self, scope: &Scope) -> StorageResult<Option<i64>> {
        Ok(self
            .get_collection(TIMESTAMPS)
            .find_one(doc! { "_id": scope_key(scope) })
            .await
            .map_err(backend)?
            .and_then(|document| document.get_i64("value").ok()))
    }

    /// Assigns the next timestamp of a scope with a bounded compare-and-swap loop.
    async fn bump(&self, scope: &Scope) -> StorageResult<i64> {
        let timestamps = self.get_collection(TIMESTAMPS);

        for attempt in 1..=self.cas.max_attempts {
            let previous = self.read_timestamp(scope).await?;
            let next = next_timestamp(previous, self.clock.now_millis());

            let swapped = match previous {
                Some(previous) => {
                    timestamps
                        .update_one(
                            doc! { "_id": scope_key(scope), "value": previous },
                            doc! { "$set": { "value": next } },
                        )
                        .await
                        .map_err(backend)?
                        .modified_count
                        == 1
                }
                None => match timestamps
                    .insert_one(doc! { "_id": scope_key(scope), "value": next })
                    .await
                {
                    Ok(_) => true,
                    Err(err) if is_duplicate_key(&err) => false,
                    Err(err) => return Err(backend(err)),
                },
            };

            if swapped {
                return Ok(next);
            }
            debug!(%scope, attempt, "collection timestamp changed concurrently, retrying");
        }

        warn!(%scope, attempts = self.cas.max_attempts, "collection timestamp bump gave up");
        Err(StorageError::backend_message(format!(
            "could not bump the collection timestamp of {scope} after {} attempts",
            self.cas.max_attempts
        )))
    }

    async fn heartbeat(&self) -> StorageResult<()> {
        if self.readonly {
            self.database()
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(backend)?;
            return Ok(());
        }

        let now = self.clock.now_millis();
        let heartbeat = self.get_collection(HEARTBEAT);
        heartbeat
            .replace_one(doc! { "_id": HEARTBEAT }, doc! { "_id": HEARTBEAT, "at": now })
            .upsert(true)
            .await
            .map_err(backend)?;
        heartbeat
            .find_one(doc! { "_id": HEARTBEAT, "at": now })
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::backend_message("heartbeat was not stored"))?;

        Ok(())
    }

    async fn shutdown(self) -> StorageResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MongoDbStore {
    async fn initialize_schema(&self) -> StorageResult<()> {
        self.get_collection(RECORDS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "collection_id": 1, "owner_id": 1, "last_modified": 1 })
                    .build(),
            )
            .await
            .map_err(backend)?;

        info!(database = %self.database, "MongoDB indexes created");
        Ok(())
    }

    async fn flush(&self) -> StorageResult<()> {
        self.ensure_writable()?;

        for name in [RECORDS, TIMESTAMPS] {
            self.get_collection(name)
                .delete_many(doc! {})
                .await
                .map_err(backend)?;
        }

        debug!(database = %self.database, "MongoDB store flushed");
        Ok(())
    }

    async fn ping(&self) -> bool {
        match self.heartbeat().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "MongoDB health check failed");
                false
            }
        }
    }

    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64> {
        if let Some(timestamp) = self.read_timestamp(scope).await? {
            return Ok(timestamp);
        }

        self.ensure_writable()?;
        let now = self.clock.now_millis();
        match self
            .get_collection(TIMESTAMPS)
            .insert_one(doc! { "_id": scope_key(scope), "value": now })
            .await
        {
            Ok(_) => Ok(now),
            Err(err) if is_duplicate_key(&err) => self
                .read_timestamp(scope)
                .await?
                .ok_or_else(|| StorageError::backend_message("collection timestamp vanished")),
            Err(err) => Err(backend(err)),
        }
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

        let existing = self.load(scope, false).await?;
        check_unicity(&existing, &record, unique_fields, WriteKind::Create)?;

        let timestamp = self.bump(scope).await?;
        record.set_last_modified(timestamp);
        self.store(scope, &record).await?;

        debug!(%scope, id = record.id().unwrap_or_default(), timestamp, "record created");
        Ok(record)
    }

    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        let document = self
            .get_collection(RECORDS)
            .find_one(doc! { "_id": record_key(scope, id), "deleted": false })
            .await
            .map_err(backend)?
            .ok_or_else(|| StorageError::RecordNotFound(id.to_string()))?;

        self.restore_document(&document)
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

        let existing = self.load(scope, false).await?;
        check_unicity(&existing, &record, unique_fields, WriteKind::Update)?;

        let timestamp = self.bump(scope).await?;
        record.set_last_modified(timestamp);
        self.store(scope, &record).await?;

        debug!(%scope, %id, timestamp, "record updated");
        Ok(record)
    }

    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        self.ensure_writable()?;

        let records = self.get_collection(RECORDS);
        let live = doc! { "_id": record_key(scope, id), "deleted": false };
        if records.find_one(live.clone()).await.map_err(backend)?.is_none() {
            return Err(StorageError::RecordNotFound(id.to_string()));
        }

        let timestamp = self.bump(scope).await?;
        let tombstone = Record::tombstone(id, timestamp);
        let replaced = records
            .replace_one(live, self.prepare_document(scope, &tombstone)?)
            .await
            .map_err(backend)?;
        if replaced.matched_count == 0 {
            return Err(StorageError::RecordNotFound(id.to_string()));
        }

        debug!(%scope, %id, timestamp, "record deleted");
        Ok(tombstone)
    }

    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        self.ensure_writable()?;

        let existing = self.load(scope, false).await?;
        let mut victims: Vec<&str> = apply_filters(&existing, filters)
            .into_iter()
            .filter_map(Record::id)
            .collect();
        victims.sort_unstable();

        let mut tombstones = Vec::with_capacity(victims.len());
        for id in victims {
            let timestamp = self.bump(scope).await?;
            let tombstone = Record::tombstone(id, timestamp);
            self.store(scope, &tombstone).await?;
            tombstones.push(tombstone);
        }

        debug!(%scope, deleted = tombstones.len(), "records deleted");
        Ok(tombstones)
    }

    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page> {
        let records = self.load(scope, query.include_deleted).await?;
        let (records, total_count) = extract_record_set(&records, query);

        Ok(Page::new(records, total_count))
    }

    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize> {
        self.ensure_writable()?;

        let mut filter = scope_key(scope);
        filter.insert("deleted", true);
        if let Some(before) = before {
            filter.insert("last_modified", doc! { "$lt": before });
        }

        let purged = self
            .get_collection(RECORDS)
            .delete_many(filter)
            .await
            .map_err(backend)?
            .deleted_count as usize;

        debug!(%scope, purged, "tombstones purged");
        Ok(purged)
    }

    async fn shutdown(self) -> StorageResult<()> {
        self.shutdown().await
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
    max_pool_size: Option<u32>,
    connect_timeout: Option<Duration>,
    server_selection_timeout: Option<Duration>,
    clock: Option<ClockRef>,
    id_generator: Option<IdGeneratorRef>,
    cas: CasPolicy,
    readonly: bool,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
            max_pool_size: None,
            connect_timeout: None,
            server_selection_timeout: None,
            clock: None,
            id_generator: None,
            cas: CasPolicy::default(),
            readonly: false,
        }
    }

    pub fn max_pool_size(mut self, size: u32) -> Self {
        self.max_pool_size = Some(size);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Bounds how long an operation waits for a reachable server before failing.
    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
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

    pub fn cas_policy(mut self, cas: CasPolicy) -> Self {
        self.cas = cas;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

#[async_trait]
impl StorageBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> StorageResult<Self::Backend> {
        let id_generator = self.id_generator.unwrap_or_else(uuid_generator);
        validate_generator(id_generator.as_ref())?;

        let mut options = ClientOptions::parse(&self.dsn)
            .await
            .map_err(|e| StorageError::Initialization(e.to_string()))?;
        if let Some(size) = self.max_pool_size {
            options.max_pool_size = Some(size);
        }
        if let Some(timeout) = self.connect_timeout {
            options.connect_timeout = Some(timeout);
        }
        if let Some(timeout) = self.server_selection_timeout {
            options.server_selection_timeout = Some(timeout);
        }

        let client = Client::with_options(options)
            .map_err(|e| StorageError::Initialization(e.to_string()))?;

        Ok(MongoDbStore {
            client,
            database: self.database,
            clock: self.clock.unwrap_or_else(system_clock),
            id_generator,
            cas: self.cas,
            readonly: self.readonly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> MongoDbStore {
        // Parsing a DSN does not connect.
        MongoDbStore::builder("mongodb://localhost:27017", "syncstore")
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn documents_round_trip_with_escaped_keys() {
        let store = store().await;
        let scope = Scope::new("articles", "alice");
        let record = Record::from_value(json!({
            "id": "abc",
            "last_modified": 42,
            "title": "Hello",
            "meta": {"a.b": 1, "$tag": [true, null, 1.5]},
        }))
        .unwrap();

        let document = store.prepare_document(&scope, &record).unwrap();

        assert_eq!(
            document.get_document("data").unwrap(),
            &doc! {
                "title": "Hello",
                "meta": { "a%2Eb": 1_i64, "%24tag": [true, Bson::Null, 1.5] },
            }
        );
        assert_eq!(document.get_bool("deleted").unwrap(), false);
        assert_eq!(store.restore_document(&document).unwrap(), record);
    }

    #[tokio::test]
    async fn tombstones_round_trip() {
        let store = store().await;
        let scope = Scope::new("articles", "alice");
        let tombstone = Record::tombstone("abc", 7);

        let document = store.prepare_document(&scope, &tombstone).unwrap();

        assert_eq!(document.get_document("data").unwrap(), &Document::new());
        assert_eq!(store.restore_document(&document).unwrap(), tombstone);
    }

    #[tokio::test]
    async fn readonly_store_rejects_writes_before_connecting() {
        let store = MongoDbStore::builder("mongodb://localhost:27017", "syncstore")
            .readonly(true)
            .build()
            .await
            .unwrap();
        let scope = Scope::new("articles", "alice");

        let err = store.create(&scope, Record::new(), &[]).await.unwrap_err();

        assert!(matches!(err, StorageError::Readonly(_)));
    }
}
