//! MongoDB backend implementation for syncstore.
//!
//! This crate provides the remote key/value implementation of the `StorageBackend`
//! trait. MongoDB is only used for single-document reads and writes: records are
//! addressed by key, collection timestamps are bumped with an optimistic
//! compare-and-swap loop, and filtering, sorting and pagination run in process with
//! the same algorithms as the in-memory backend.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! syncstore = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to a self-hosted or managed MongoDB
//! - **Lock-free timestamps** - Bounded compare-and-swap retries, never a blocking lock
//! - **Arbitrary JSON bodies** - Field names MongoDB rejects are escaped transparently
//! - **Read-only mode** - Writes are rejected and the health check only reads
//!
//! # Example
//!
//! ```ignore
//! use syncstore::{backend::StorageBackendBuilder, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "syncstore")
//!         .build()
//!         .await?;
//!     store.initialize_schema().await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as syncstore_mongodb;

pub mod store;
pub(crate) mod sanitizer;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
