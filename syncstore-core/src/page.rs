//! Result pages of `get_all`.

use serde::{Deserialize, Serialize};

use crate::{
    pagination::build_pagination_rules,
    query::{PaginationRule, Sort},
    record::Record,
};

/// A page of records, along with the number of live records matching the filters.
///
/// # Example
///
/// ```ignore
/// let sorting = vec![Sort::desc("last_modified")];
/// let page = store.get_all(&scope, &query).await?;
///
/// if let Some(rules) = page.next_pagination_rules(&sorting) {
///     let next = ListQuery::builder()
///         .sorting(sorting)
///         .pagination_rules(rules)
///         .limit(10)
///         .build();
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// The records of this page, in sort order.
    pub records: Vec<Record>,
    /// Live records matching the filters, ignoring pagination rules and limit.
    pub total_count: usize,
}

impl Page {
    pub fn new(records: Vec<Record>, total_count: usize) -> Self {
        Self { records, total_count }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The rules fetching the records that follow this page under `sorting`.
    ///
    /// Returns `None` for an empty page.
    pub fn next_pagination_rules(&self, sorting: &[Sort]) -> Option<Vec<PaginationRule>> {
        self.records
            .last()
            .map(|last| build_pagination_rules(sorting, last))
    }
}

impl IntoIterator for Page {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
