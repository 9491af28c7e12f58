//! Query construction: filters, sorting and pagination rules.
//!
//! This module only holds value objects. Evaluation lives in
//! [`evaluator`](crate::evaluator) for backends working on materialized records, while
//! native backends translate the same objects through a [`FilterVisitor`].
//!
//! # Query Building
//!
//! ```ignore
//! use syncstore::query::{Filter, ListQuery, SortDirection};
//!
//! let query = ListQuery::builder()
//!     .filter(Filter::eq("status", 1))
//!     .sort("title", SortDirection::Asc)
//!     .limit(10)
//!     .build();
//! ```
//!
//! # Pagination rules
//!
//! A [`PaginationRule`] is a list of filters combined with AND. A list of rules is
//! combined with OR, and characterizes "every record sorting after the last one seen".
//! See [`pagination::build_pagination_rules`](crate::pagination::build_pagination_rules).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;

/// Comparison operators supported by filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    /// Equal to.
    Eq,
    /// Not equal to.
    Not,
    /// Strictly less than.
    Lt,
    /// Strictly greater than.
    Gt,
    /// Greater than or equal to.
    Min,
    /// Less than or equal to.
    Max,
}

/// A single field predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// The field name, possibly a dotted path into nested objects.
    pub field: String,
    /// The value to compare against. `null` stands for "unset".
    pub value: Value,
    /// The comparison operator.
    pub operator: Comparison,
}

impl Filter {
    pub fn new(field: impl Into<String>, value: impl Into<Value>, operator: Comparison) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            operator,
        }
    }

    /// Matches records where the field equals the value.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value, Comparison::Eq)
    }

    /// Matches records where the field differs from the value.
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value, Comparison::Not)
    }

    /// Matches records where the field is strictly less than the value.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value, Comparison::Lt)
    }

    /// Matches records where the field is strictly greater than the value.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value, Comparison::Gt)
    }

    /// Matches records where the field is greater than or equal to the value.
    pub fn min(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value, Comparison::Min)
    }

    /// Matches records where the field is less than or equal to the value.
    pub fn max(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, value, Comparison::Max)
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    /// Ascending order, unset values last.
    Asc,
    /// Descending order, unset values first.
    Desc,
}

impl SortDirection {
    /// `+1` for ascending, `-1` for descending.
    pub fn signum(self) -> i8 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

impl From<i8> for SortDirection {
    fn from(direction: i8) -> Self {
        if direction < 0 {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    /// The field name to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

impl Sort {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self { field: field.into(), direction }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Desc)
    }
}

/// Filters combined with AND.
pub type PaginationRule = Vec<Filter>;

/// Parameters of a `get_all` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    /// Filters combined with AND.
    pub filters: Vec<Filter>,
    /// Cumulative sort keys, first key is primary.
    pub sorting: Vec<Sort>,
    /// Rules combined with OR; empty means no pagination.
    pub pagination_rules: Vec<PaginationRule>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
    /// Whether tombstones matching the filters are returned too.
    pub include_deleted: bool,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> ListQueryBuilder {
        ListQueryBuilder::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQueryBuilder {
    query: ListQuery,
}

impl ListQueryBuilder {
    pub fn new() -> Self {
        ListQueryBuilder { query: ListQuery::default() }
    }

    /// Adds a filter, combined with the previous ones using AND.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.query.filters.push(filter);
        self
    }

    /// Replaces all filters.
    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.query.filters = filters.into_iter().collect();
        self
    }

    /// Appends a sort key.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.query.sorting.push(Sort::new(field, direction));
        self
    }

    /// Replaces the sort specification.
    pub fn sorting(mut self, sorting: impl IntoIterator<Item = Sort>) -> Self {
        self.query.sorting = sorting.into_iter().collect();
        self
    }

    /// Sets the pagination rules.
    pub fn pagination_rules(mut self, rules: impl IntoIterator<Item = PaginationRule>) -> Self {
        self.query.pagination_rules = rules.into_iter().collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn include_deleted(mut self, include_deleted: bool) -> Self {
        self.query.include_deleted = include_deleted;
        self
    }

    pub fn build(self) -> ListQuery {
        self.query
    }
}

/// Translates filters and rules into a backend representation.
///
/// Implementors provide the translation of a single filter; conjunctions and
/// disjunctions are assembled through [`visit_all`](FilterVisitor::visit_all) and
/// [`visit_any`](FilterVisitor::visit_any).
pub trait FilterVisitor {
    type Output;
    type Error: Into<StorageError>;

    fn visit_filter(&mut self, filter: &Filter) -> Result<Self::Output, Self::Error>;

    /// Combines the given outputs with AND. Receives an empty list for "always true".
    fn combine_all(&mut self, outputs: Vec<Self::Output>) -> Result<Self::Output, Self::Error>;

    /// Combines the given outputs with OR. Receives an empty list for "always false".
    fn combine_any(&mut self, outputs: Vec<Self::Output>) -> Result<Self::Output, Self::Error>;

    fn visit_all(&mut self, filters: &[Filter]) -> Result<Self::Output, Self::Error> {
        let outputs = filters
            .iter()
            .map(|filter| self.visit_filter(filter))
            .collect::<Result<Vec<_>, _>>()?;
        self.combine_all(outputs)
    }

    fn visit_any(&mut self, rules: &[PaginationRule]) -> Result<Self::Output, Self::Error> {
        let outputs = rules
            .iter()
            .map(|rule| self.visit_all(rule))
            .collect::<Result<Vec<_>, _>>()?;
        self.combine_any(outputs)
    }
}
