//! Convenient re-exports of commonly used types from syncstore.
//!
//! ```ignore
//! use syncstore::prelude::*;
//! ```

pub use syncstore_core::{
    backend::{DynStorageBackend, StorageBackend, StorageBackendBuilder},
    collection::Collection,
    error::{StorageError, StorageResult},
    page::Page,
    query::{Comparison, Filter, ListQuery, ListQueryBuilder, PaginationRule, Sort, SortDirection},
    record::{Record, Scope},
    store::{DynRecordStore, RecordStore},
    timestamp::{Clock, ManualClock, SystemClock},
};
