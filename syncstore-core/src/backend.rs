//! Storage backend abstraction.
//!
//! This module defines the contract every persistence layer implements, so that the
//! resource layer behaves identically whether records live in process memory, in a
//! remote key/value store or in a relational database.
//!
//! # Overview
//!
//! The [`StorageBackend`] trait provides a unified async interface over scoped record
//! collections: CRUD with tombstones, filtered/sorted/paginated listing, collection
//! timestamps and maintenance operations. Every record operation takes the [`Scope`]
//! it works on; scopes never see each other's records, timestamps or unique values.
//!
//! # Traits
//!
//! - [`StorageBackend`]: The core trait for storage backends
//! - [`DynStorageBackend`]: A trait for dynamic dispatch over backend implementations
//! - [`StorageBackendBuilder`]: Factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use syncstore::prelude::*;
//! use serde_json::json;
//!
//! let backend = InMemoryStore::builder().build().await?;
//! let scope = Scope::new("articles", "alice");
//!
//! let created = backend
//!     .create(&scope, Record::from_value(json!({"title": "Hello"}))?, &[])
//!     .await?;
//! let timestamp = backend.collection_timestamp(&scope).await?;
//! assert_eq!(created.last_modified(), Some(timestamp));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use std::{any::Any, fmt::Debug};

use crate::{
    error::StorageResult,
    page::Page,
    query::{Filter, ListQuery},
    record::{Record, Scope},
};

/// Abstract interface for record storage backends.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. Writes to the same scope are serialized with respect to the collection
/// timestamp: two writes never receive the same `last_modified`, and a later write never
/// receives a smaller one.
///
/// # Error Handling
///
/// Operations return [`StorageResult<T>`](crate::error::StorageResult). Failures of the
/// underlying service surface as [`StorageError::Backend`](crate::error::StorageError::Backend)
/// and are never retried, except inside the timestamp compare-and-swap loop of
/// backends that use one.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Creates the tables, indexes or keys the backend needs. Idempotent.
    async fn initialize_schema(&self) -> StorageResult<()>;

    /// Removes every record, tombstone and timestamp of every scope.
    ///
    /// A read-only backend refuses to flush, like any other write.
    async fn flush(&self) -> StorageResult<()>;

    /// Health probe. Never fails: any error is reported as `false`.
    ///
    /// Writes then reads a marker, or only reads when the backend is read-only.
    async fn ping(&self) -> bool;

    /// Returns the collection timestamp of a scope.
    ///
    /// On a scope that was never written, the current time is stored atomically and
    /// returned; it then floors every later timestamp of that scope.
    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64>;

    /// Creates a record.
    ///
    /// Assigns an id when the record has none (a client-supplied id must match the id
    /// generator format), checks the unique fields, assigns `last_modified` and bumps
    /// the collection timestamp.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Unicity`](crate::error::StorageError::Unicity) when a live
    ///   record already holds one of the unique values or the client-supplied id
    /// - [`StorageError::InvalidRecord`](crate::error::StorageError::InvalidRecord) when
    ///   the client-supplied id is malformed
    async fn create(
        &self,
        scope: &Scope,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record>;

    /// Retrieves a live record.
    ///
    /// # Errors
    ///
    /// [`StorageError::RecordNotFound`](crate::error::StorageError::RecordNotFound) when
    /// the id is unknown or tombstoned.
    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record>;

    /// Replaces or creates the record with the given id.
    ///
    /// Unique fields are checked against every other live record of the scope.
    async fn update(
        &self,
        scope: &Scope,
        id: &str,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record>;

    /// Replaces a live record by its tombstone and returns the tombstone.
    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record>;

    /// Deletes every live record matching all filters, in id order.
    ///
    /// Each deletion bumps the collection timestamp, so the returned tombstones carry
    /// strictly increasing timestamps.
    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>>;

    /// Lists records.
    ///
    /// Filters apply first, to records and tombstones alike. The total count covers
    /// the live records matching the filters. Pagination rules, sorting (with a final
    /// tie-break on id) and limit then shape the returned page.
    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page>;

    /// Physically removes tombstones, all of them or those older than `before`.
    ///
    /// Returns how many were removed. Does not bump the collection timestamp.
    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize>;

    /// Cleanly shuts down the backend, releasing connections.
    ///
    /// The default implementation is a no-op.
    async fn shutdown(self) -> StorageResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

#[async_trait]
impl<B> StorageBackend for &B
where
    B: StorageBackend,
{
    async fn initialize_schema(&self) -> StorageResult<()> {
        StorageBackend::initialize_schema(*self).await
    }

    async fn flush(&self) -> StorageResult<()> {
        StorageBackend::flush(*self).await
    }

    async fn ping(&self) -> bool {
        StorageBackend::ping(*self).await
    }

    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64> {
        StorageBackend::collection_timestamp(*self, scope).await
    }

    async fn create(
        &self,
        scope: &Scope,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        StorageBackend::create(*self, scope, record, unique_fields).await
    }

    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        StorageBackend::get(*self, scope, id).await
    }

    async fn update(
        &self,
        scope: &Scope,
        id: &str,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        StorageBackend::update(*self, scope, id, record, unique_fields).await
    }

    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        StorageBackend::delete(*self, scope, id).await
    }

    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        StorageBackend::delete_all(*self, scope, filters).await
    }

    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page> {
        StorageBackend::get_all(*self, scope, query).await
    }

    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize> {
        StorageBackend::purge_deleted(*self, scope, before).await
    }
}

/// Object-safe counterpart of [`StorageBackend`], implemented for every backend.
///
/// Used when the backend kind is only known at runtime, for instance when it comes from
/// configuration.
#[async_trait]
pub trait DynStorageBackend: Send + Sync + Debug {
    async fn initialize_schema(&self) -> StorageResult<()>;
    async fn flush(&self) -> StorageResult<()>;
    async fn ping(&self) -> bool;
    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64>;
    async fn create(
        &self,
        scope: &Scope,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record>;
    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record>;
    async fn update(
        &self,
        scope: &Scope,
        id: &str,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record>;
    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record>;
    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>>;
    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page>;
    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize>;
    async fn shutdown_boxed(self: Box<Self>) -> StorageResult<()>;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

#[async_trait]
impl<B: StorageBackend + Send + Sync + 'static> DynStorageBackend for B {
    async fn initialize_schema(&self) -> StorageResult<()> {
        StorageBackend::initialize_schema(self).await
    }

    async fn flush(&self) -> StorageResult<()> {
        StorageBackend::flush(self).await
    }

    async fn ping(&self) -> bool {
        StorageBackend::ping(self).await
    }

    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64> {
        StorageBackend::collection_timestamp(self, scope).await
    }

    async fn create(
        &self,
        scope: &Scope,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        StorageBackend::create(self, scope, record, unique_fields).await
    }

    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        StorageBackend::get(self, scope, id).await
    }

    async fn update(
        &self,
        scope: &Scope,
        id: &str,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        StorageBackend::update(self, scope, id, record, unique_fields).await
    }

    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        StorageBackend::delete(self, scope, id).await
    }

    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        StorageBackend::delete_all(self, scope, filters).await
    }

    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page> {
        StorageBackend::get_all(self, scope, query).await
    }

    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize> {
        StorageBackend::purge_deleted(self, scope, before).await
    }

    async fn shutdown_boxed(self: Box<Self>) -> StorageResult<()> {
        StorageBackend::shutdown(*self).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A boxed dynamic backend is itself a backend, so typed wrappers such as
/// [`RecordStore`](crate::store::RecordStore) accept backends chosen at runtime.
#[async_trait]
impl StorageBackend for Box<dyn DynStorageBackend> {
    async fn initialize_schema(&self) -> StorageResult<()> {
        DynStorageBackend::initialize_schema(&**self).await
    }

    async fn flush(&self) -> StorageResult<()> {
        DynStorageBackend::flush(&**self).await
    }

    async fn ping(&self) -> bool {
        DynStorageBackend::ping(&**self).await
    }

    async fn collection_timestamp(&self, scope: &Scope) -> StorageResult<i64> {
        DynStorageBackend::collection_timestamp(&**self, scope).await
    }

    async fn create(
        &self,
        scope: &Scope,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        DynStorageBackend::create(&**self, scope, record, unique_fields).await
    }

    async fn get(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        DynStorageBackend::get(&**self, scope, id).await
    }

    async fn update(
        &self,
        scope: &Scope,
        id: &str,
        record: Record,
        unique_fields: &[String],
    ) -> StorageResult<Record> {
        DynStorageBackend::update(&**self, scope, id, record, unique_fields).await
    }

    async fn delete(&self, scope: &Scope, id: &str) -> StorageResult<Record> {
        DynStorageBackend::delete(&**self, scope, id).await
    }

    async fn delete_all(&self, scope: &Scope, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        DynStorageBackend::delete_all(&**self, scope, filters).await
    }

    async fn get_all(&self, scope: &Scope, query: &ListQuery) -> StorageResult<Page> {
        DynStorageBackend::get_all(&**self, scope, query).await
    }

    async fn purge_deleted(&self, scope: &Scope, before: Option<i64>) -> StorageResult<usize> {
        DynStorageBackend::purge_deleted(&**self, scope, before).await
    }

    async fn shutdown(self) -> StorageResult<()> {
        self.shutdown_boxed().await
    }
}

#[async_trait]
pub trait StorageBackendBuilder {
    type Backend: StorageBackend;

    async fn build(self) -> StorageResult<Self::Backend>;
}
