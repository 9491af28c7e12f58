//! Scoped access to records.
//!
//! A [`Collection`] binds a backend to one [`Scope`] and to the unique fields of the
//! resource, so callers do not repeat them on every call.
//!
//! # Example
//!
//! ```ignore
//! # async fn example<B: StorageBackend>(store: &RecordStore<B>) -> StorageResult<()> {
//! let articles = store
//!     .collection(Scope::new("articles", "alice"))
//!     .with_unique_fields(["slug"]);
//!
//! let created = articles.create(Record::from_value(json!({"slug": "hello"}))?).await?;
//! let page = articles
//!     .get_all(&ListQuery::builder().filter(Filter::eq("slug", "hello")).build())
//!     .await?;
//! assert_eq!(page.records, vec![created]);
//! # Ok(())
//! # }
//! ```

use crate::{
    backend::StorageBackend,
    error::StorageResult,
    page::Page,
    query::{Filter, ListQuery},
    record::{Record, Scope},
};

/// A handle on the records of one scope.
#[derive(Debug)]
pub struct Collection<'a, B: StorageBackend> {
    scope: Scope,
    unique_fields: Vec<String>,
    backend: &'a B,
}

impl<'a, B: StorageBackend> Collection<'a, B> {
    pub(crate) fn new(scope: Scope, backend: &'a B) -> Self {
        Self {
            scope,
            unique_fields: Vec::new(),
            backend,
        }
    }

    /// Sets the fields whose values must be unique among live records of the scope.
    pub fn with_unique_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn unique_fields(&self) -> &[String] {
        &self.unique_fields
    }

    /// The collection timestamp of the scope.
    pub async fn timestamp(&self) -> StorageResult<i64> {
        self.backend.collection_timestamp(&self.scope).await
    }

    pub async fn create(&self, record: Record) -> StorageResult<Record> {
        self.backend
            .create(&self.scope, record, &self.unique_fields)
            .await
    }

    pub async fn get(&self, id: &str) -> StorageResult<Record> {
        self.backend.get(&self.scope, id).await
    }

    pub async fn update(&self, id: &str, record: Record) -> StorageResult<Record> {
        self.backend
            .update(&self.scope, id, record, &self.unique_fields)
            .await
    }

    pub async fn delete(&self, id: &str) -> StorageResult<Record> {
        self.backend.delete(&self.scope, id).await
    }

    pub async fn delete_all(&self, filters: &[Filter]) -> StorageResult<Vec<Record>> {
        self.backend.delete_all(&self.scope, filters).await
    }

    pub async fn get_all(&self, query: &ListQuery) -> StorageResult<Page> {
        self.backend.get_all(&self.scope, query).await
    }

    /// Collects every page of a query, following the pagination rules of each page.
    ///
    /// The query limit, if any, is used as the page size.
    pub async fn get_all_pages(&self, query: &ListQuery) -> StorageResult<Vec<Record>> {
        let mut query = query.clone();
        let mut records = Vec::new();

        loop {
            let page = self.get_all(&query).await?;
            let exhausted = match query.limit {
                Some(limit) => page.len() < limit || limit == 0,
                None => true,
            };
            let next_rules = page.next_pagination_rules(&query.sorting);
            records.extend(page);

            match next_rules {
                Some(rules) if !exhausted => query.pagination_rules = rules,
                _ => return Ok(records),
            }
        }
    }

    /// Removes tombstones of the scope, optionally only those older than `before`.
    pub async fn purge_deleted(&self, before: Option<i64>) -> StorageResult<usize> {
        self.backend.purge_deleted(&self.scope, before).await
    }
}
