//! Sorting, pagination rules and result set extraction.
//!
//! Backends that materialize the records of a scope run [`extract_record_set`] over
//! them. The relational backend produces the same result natively.

use std::cmp::Ordering;

use crate::{
    evaluator::{Comparable, RecordEvaluator},
    query::{Filter, ListQuery, PaginationRule, Sort, SortDirection},
    record::{ID_FIELD, MODIFIED_FIELD, Record},
};

/// Compares two records over the sort keys, then by id ascending.
///
/// Unset values sort last in ascending order and first in descending order.
pub fn compare_records(a: &Record, b: &Record, sorting: &[Sort]) -> Ordering {
    for sort in sorting {
        let left = Comparable::from(a.resolve(&sort.field));
        let right = Comparable::from(b.resolve(&sort.field));

        let ordering = match sort.direction {
            SortDirection::Asc => left.order(&right),
            SortDirection::Desc => right.order(&left),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a.id().cmp(&b.id())
}

/// Sorts records in place. The sort is stable.
pub fn apply_sorting(records: &mut [&Record], sorting: &[Sort]) {
    records.sort_by(|a, b| compare_records(a, b, sorting));
}

/// Selects, counts, sorts and truncates records for a `get_all` call.
///
/// Returns the selected records and the number of live records matching the filters,
/// counted before pagination rules and limit apply.
pub fn extract_record_set<'r>(
    records: impl IntoIterator<Item = &'r Record>,
    query: &ListQuery,
) -> (Vec<Record>, usize) {
    let filtered: Vec<&Record> = records
        .into_iter()
        .filter(|record| RecordEvaluator::matches_all(record, &query.filters))
        .filter(|record| query.include_deleted || !record.is_deleted())
        .collect();

    let total_count = filtered
        .iter()
        .filter(|record| !record.is_deleted())
        .count();

    let mut selected: Vec<&Record> = if query.pagination_rules.is_empty() {
        filtered
    } else {
        filtered
            .into_iter()
            .filter(|record| RecordEvaluator::matches_any(record, &query.pagination_rules))
            .collect()
    };

    apply_sorting(&mut selected, &query.sorting);
    if let Some(limit) = query.limit {
        selected.truncate(limit);
    }

    (selected.into_iter().cloned().collect(), total_count)
}

/// Builds the rules matching every record sorting strictly after `last_record`.
///
/// For keys `s1..sn`, the rule for key `sk` requires equality on `s1..s(k-1)` and a
/// strict inequality on `sk`. The id tie-break is included as a last key, unless the
/// sort already mentions it, so pages never overlap nor skip records.
pub fn build_pagination_rules(sorting: &[Sort], last_record: &Record) -> Vec<PaginationRule> {
    let mut keys: Vec<Sort> = sorting.to_vec();
    if !keys.iter().any(|sort| sort.field == ID_FIELD) {
        keys.push(Sort::asc(ID_FIELD));
    }

    let mut rules = Vec::with_capacity(keys.len());
    for (position, key) in keys.iter().enumerate().rev() {
        let mut rule: PaginationRule = keys[..position]
            .iter()
            .map(|previous| Filter::eq(previous.field.clone(), reference_value(last_record, &previous.field)))
            .collect();

        let value = reference_value(last_record, &key.field);
        rule.push(match key.direction {
            SortDirection::Asc => Filter::gt(key.field.clone(), value),
            SortDirection::Desc => Filter::lt(key.field.clone(), value),
        });
        rules.push(rule);
    }

    rules
}

fn reference_value(record: &Record, field: &str) -> serde_json::Value {
    record
        .resolve(field)
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

/// Appends `last_modified` descending unless the sort already uses it.
pub fn with_default_sorting(sorting: impl IntoIterator<Item = Sort>) -> Vec<Sort> {
    let mut sorting: Vec<Sort> = sorting.into_iter().collect();
    if !sorting.iter().any(|sort| sort.field == MODIFIED_FIELD) {
        sorting.push(Sort::desc(MODIFIED_FIELD));
    }
    sorting
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().filter_map(Record::id).collect()
    }

    fn sample() -> Vec<Record> {
        vec![
            record(json!({"id": "a", "status": 2, "title": "x"})),
            record(json!({"id": "b", "status": 1})),
            record(json!({"id": "c", "status": 2, "title": "w"})),
            record(json!({"id": "d", "title": "z"})),
            Record::tombstone("e", 5),
        ]
    }

    #[test]
    fn sorts_unset_last_then_by_id() {
        let records = sample();
        let query = ListQuery::builder().sort("status", SortDirection::Asc).build();

        let (selected, total) = extract_record_set(&records, &query);

        assert_eq!(ids(&selected), vec!["b", "a", "c", "d"]);
        assert_eq!(total, 4);
    }

    #[test]
    fn descending_puts_unset_first() {
        let records = sample();
        let query = ListQuery::builder()
            .sort("status", SortDirection::Desc)
            .sort("title", SortDirection::Asc)
            .build();

        let (selected, _) = extract_record_set(&records, &query);

        assert_eq!(ids(&selected), vec!["d", "c", "a", "b"]);
    }

    #[test]
    fn counts_before_rules_and_limit() {
        let records = sample();
        let query = ListQuery::builder()
            .filter(Filter::eq("status", 2))
            .pagination_rules(vec![vec![Filter::gt("id", "a")]])
            .limit(0)
            .build();

        let (selected, total) = extract_record_set(&records, &query);

        assert!(selected.is_empty());
        assert_eq!(total, 2);
    }

    #[test]
    fn tombstones_only_on_request() {
        let records = sample();
        let query = ListQuery::builder()
            .filter(Filter::max("last_modified", 10))
            .include_deleted(true)
            .build();

        let (selected, total) = extract_record_set(&records, &query);

        assert_eq!(ids(&selected), vec!["e"]);
        assert_eq!(total, 0);
    }

    #[test]
    fn rules_follow_sort_prefixes() {
        let last = record(json!({"id": "c", "status": 2, "title": "w"}));
        let sorting = vec![Sort::asc("status"), Sort::desc("title")];

        let rules = build_pagination_rules(&sorting, &last);

        assert_eq!(
            rules,
            vec![
                vec![Filter::eq("status", 2), Filter::eq("title", "w"), Filter::gt("id", "c")],
                vec![Filter::eq("status", 2), Filter::lt("title", "w")],
                vec![Filter::gt("status", 2)],
            ]
        );
    }

    #[test]
    fn pages_cover_everything_exactly_once() {
        let records = sample();
        let sorting = vec![Sort::desc("status")];
        let mut seen = Vec::new();
        let mut rules = Vec::new();

        loop {
            let query = ListQuery::builder()
                .sorting(sorting.clone())
                .pagination_rules(rules.clone())
                .limit(1)
                .build();
            let (page, _) = extract_record_set(&records, &query);
            let Some(last) = page.last() else { break };
            seen.push(last.id().unwrap().to_string());
            rules = build_pagination_rules(&sorting, last);
        }

        assert_eq!(seen, vec!["d", "a", "c", "b"]);
    }

    #[test]
    fn container_values_page_like_scalars() {
        let records = vec![
            record(json!({"id": "a", "tags": [1]})),
            record(json!({"id": "b", "tags": [2]})),
            record(json!({"id": "c", "tags": [3]})),
            record(json!({"id": "d", "tags": [2]})),
            record(json!({"id": "e", "tags": {"k": 1}})),
        ];
        let sorting = vec![Sort::asc("tags")];
        let mut seen = Vec::new();
        let mut rules = Vec::new();

        loop {
            let query = ListQuery::builder()
                .sorting(sorting.clone())
                .pagination_rules(rules.clone())
                .limit(1)
                .build();
            let (page, _) = extract_record_set(&records, &query);
            let Some(last) = page.last() else { break };
            seen.push(last.id().unwrap().to_string());
            rules = build_pagination_rules(&sorting, last);
        }

        assert_eq!(seen, vec!["a", "b", "d", "c", "e"]);
    }

    #[test]
    fn default_sorting_is_appended_once() {
        assert_eq!(with_default_sorting(vec![]), vec![Sort::desc("last_modified")]);
        assert_eq!(
            with_default_sorting(vec![Sort::asc("last_modified")]),
            vec![Sort::asc("last_modified")]
        );
    }
}
