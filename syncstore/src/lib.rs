//! Main syncstore crate providing a unified interface for JSON record storage.
//!
//! This crate is the primary entry point for users of syncstore. It re-exports the
//! core types and functionality from the sub-crates and gives access to the storage
//! backends, selected at compile time through features or at runtime through
//! [`settings::StorageSettings`].
//!
//! # Features
//!
//! - **Monotonic revisions** - Every write gets a strictly increasing per-collection timestamp
//! - **Tombstones** - Deleted records leave a marker that sync clients can fetch
//! - **Unique fields** - Per-resource unicity, reported with the conflicting record
//! - **Cursor pagination** - Filter, sort and resume after the last record seen
//! - **Multiple backends** - In-memory, MongoDB and PostgreSQL, with identical semantics
//!
//! # Quick Start
//!
//! ```ignore
//! use syncstore::{prelude::*, memory::InMemoryStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RecordStore::new(InMemoryStore::builder().build().await?);
//!     let articles = store
//!         .collection(Scope::new("articles", "alice"))
//!         .with_unique_fields(["slug"]);
//!
//!     let created = articles
//!         .create(Record::from_value(json!({"slug": "hello", "status": 1}))?)
//!         .await?;
//!
//!     let page = articles
//!         .get_all(&ListQuery::builder().filter(Filter::eq("status", 1)).limit(10).build())
//!         .await?;
//!     assert_eq!(page.records, vec![created]);
//!
//!     // Fetch what changed since the last sync.
//!     let since = articles.timestamp().await?;
//!     let changes = articles
//!         .get_all(
//!             &ListQuery::builder()
//!                 .filter(Filter::gt("last_modified", since))
//!                 .include_deleted(true)
//!                 .build(),
//!         )
//!         .await?;
//!     assert!(changes.is_empty());
//!
//!     store.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Runtime configuration
//!
//! When the backend is only known from configuration, [`connect`] builds a boxed
//! backend that [`DynRecordStore`](store::DynRecordStore) accepts:
//!
//! ```ignore
//! use syncstore::{prelude::*, settings::StorageSettings};
//!
//! let settings: StorageSettings = serde_json::from_str(r#"{
//!     "backend": "postgresql",
//!     "url": "postgres://localhost/syncstore",
//!     "max_connections": 20
//! }"#)?;
//! let store = DynRecordStore::new(syncstore::connect(&settings).await?);
//! store.initialize_schema().await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-process storage for development and testing
//! - [`mongodb`] - MongoDB used as a key/value store (requires `mongodb` feature)
//! - [`postgres`] - PostgreSQL (requires `postgres` feature)

pub mod prelude;
pub mod settings;

pub use syncstore_core::{
    backend, collection, error, evaluator, id, page, pagination, query, record, store, timestamp,
    unicity,
};

#[cfg(feature = "testing")]
pub use syncstore_core::testing;

pub use settings::connect;

// Record bodies are JSON values.
pub use serde_json;

/// In-memory storage backend implementations.
pub mod memory {
    pub use syncstore_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use syncstore_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}

/// PostgreSQL storage backend implementations.
///
/// This module is only available when the `postgres` feature is enabled.
#[cfg(feature = "postgres")]
pub mod postgres {
    pub use syncstore_postgres::{PostgresStore, PostgresStoreBuilder};
}
