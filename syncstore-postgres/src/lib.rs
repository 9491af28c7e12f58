//! PostgreSQL backend implementation for syncstore.
//!
//! This crate provides the relational implementation of the `StorageBackend` trait.
//! Filters, sorting and pagination rules are compiled to SQL over a JSONB column, and
//! every write runs in one transaction that also bumps the collection timestamp, so a
//! failed write (unicity violation included) leaves no trace.
//!
//! To use this backend, include the `postgres` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! syncstore = { version = "x.y.z", features = ["postgres"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use syncstore::{backend::StorageBackendBuilder, postgres::PostgresStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::builder("postgres://localhost/syncstore")
//!         .max_connections(20)
//!         .build()
//!         .await?;
//!     store.initialize_schema().await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as syncstore_postgres;

pub(crate) mod sql;
pub mod store;

pub use store::{PostgresStore, PostgresStoreBuilder};
