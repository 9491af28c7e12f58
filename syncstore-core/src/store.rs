//! Main record store interface.
//!
//! [`RecordStore`] wraps a backend and hands out [`Collection`]s, handles bound to one
//! scope and one set of unique fields. It is the entry point the resource layer uses.
//!
//! # Example
//!
//! ```ignore
//! use syncstore::prelude::*;
//!
//! let store = RecordStore::new(backend);
//! let articles = store
//!     .collection(Scope::new("articles", "alice"))
//!     .with_unique_fields(["slug"]);
//! ```

use crate::{
    backend::{DynStorageBackend, StorageBackend},
    collection::Collection,
    error::StorageResult,
    record::Scope,
};

/// A record store bound to a specific backend implementation.
///
/// # Type Parameters
///
/// * `B` - The backend implementation type
#[derive(Debug)]
pub struct RecordStore<B: StorageBackend> {
    backend: B,
}

/// A record store whose backend was chosen at runtime.
pub type DynRecordStore = RecordStore<Box<dyn DynStorageBackend>>;

impl<B: StorageBackend> RecordStore<B> {
    /// Creates a new record store with the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Gets a collection handle for the given scope, with no unique fields.
    pub fn collection(&self, scope: Scope) -> Collection<'_, B> {
        Collection::new(scope, &self.backend)
    }

    /// Creates the backend schema. Safe to call on every start.
    pub async fn initialize_schema(&self) -> StorageResult<()> {
        self.backend.initialize_schema().await
    }

    /// Removes all data of all scopes.
    pub async fn flush(&self) -> StorageResult<()> {
        self.backend.flush().await
    }

    /// Health check of the backend.
    pub async fn ping(&self) -> bool {
        self.backend.ping().await
    }

    /// Shuts down the store and its backend.
    pub async fn shutdown(self) -> StorageResult<()> {
        self.backend.shutdown().await
    }
}

impl<B: StorageBackend> From<B> for RecordStore<B> {
    fn from(backend: B) -> Self {
        Self::new(backend)
    }
}
