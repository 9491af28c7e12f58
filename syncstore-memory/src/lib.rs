//! In-memory record storage backend for syncstore.
//!
//! This crate provides a thread-safe, in-process implementation of the `StorageBackend`
//! trait. It is meant for development, tests and single-process deployments: data does
//! not survive the process.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads, serialized writes through an async-aware RwLock
//! - **Shared semantics** - Filtering, sorting, pagination and unicity run the core algorithms
//! - **Read-only mode** - Every write is rejected, reads keep working
//!
//! # Quick Start
//!
//! ```ignore
//! use syncstore::prelude::*;
//! use syncstore::memory::InMemoryStore;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = RecordStore::new(InMemoryStore::builder().build().await?);
//!     let articles = store.collection(Scope::new("articles", "alice"));
//!
//!     let created = articles.create(Record::from_value(json!({"title": "Hello"}))?).await?;
//!     assert_eq!(articles.get(created.id().unwrap()).await?, created);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as syncstore_memory;

pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
