//! Backend-agnostic storage engine for JSON records.
//!
//! This crate is the core of the syncstore project and provides:
//!
//! - **Records and scopes** ([`record`]) - JSON records, tombstones and the `(collection, owner)` scopes they live in
//! - **Query model** ([`query`]) - Filters, sort keys and pagination rules
//! - **Evaluation** ([`evaluator`]) - Filter semantics over materialized records
//! - **Pagination engine** ([`pagination`]) - Sorting, rule construction and result set extraction
//! - **Timestamp oracle** ([`timestamp`]) - Monotonic per-scope revision timestamps
//! - **Unicity checker** ([`unicity`]) - Unique field enforcement
//! - **Id generation** ([`id`]) - Record identifiers
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Record store** ([`store`], [`collection`]) - High-level, scope-bound API
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! With the `testing` feature, [`testing`] holds the conformance suite every backend runs.
//!
//! # Example
//!
//! ```ignore
//! use syncstore_core::{query::{Filter, ListQuery}, record::{Record, Scope}, store::RecordStore};
//! use serde_json::json;
//!
//! let store = RecordStore::new(backend);
//! let articles = store.collection(Scope::new("articles", "alice"));
//!
//! articles.create(Record::from_value(json!({"title": "Hello", "status": 1}))?).await?;
//! let page = articles
//!     .get_all(&ListQuery::builder().filter(Filter::eq("status", 1)).build())
//!     .await?;
//! assert_eq!(page.total_count, 1);
//! ```

#[allow(unused_extern_crates)]
extern crate self as syncstore_core;

pub mod backend;
pub mod collection;
pub mod error;
pub mod evaluator;
pub mod id;
pub mod page;
pub mod pagination;
pub mod query;
pub mod record;
pub mod store;
pub mod timestamp;
pub mod unicity;

#[cfg(feature = "testing")]
pub mod testing;
