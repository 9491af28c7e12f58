//! Unique field enforcement.
//!
//! Each unique field with a set value becomes a rule `field == value`, extended with
//! `id != candidate` when the candidate already exists (updates). A client-supplied id
//! on creation is treated as one more unique field. Tombstones and unset values never
//! take part in the check.

use crate::{
    error::{StorageError, StorageResult},
    evaluator::RecordEvaluator,
    query::Filter,
    record::{ID_FIELD, Record},
};

/// The filters selecting records that would collide on one field.
#[derive(Debug, Clone, PartialEq)]
pub struct UnicityRule {
    pub field: String,
    pub filters: Vec<Filter>,
}

/// Whether the check runs for a creation or for an update of an existing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Update,
}

/// Builds the rules for `record` over `unique_fields`, in field order, without duplicates.
pub fn unicity_rules(record: &Record, unique_fields: &[String], kind: WriteKind) -> Vec<UnicityRule> {
    let mut fields: Vec<&str> = Vec::with_capacity(unique_fields.len() + 1);
    for field in unique_fields.iter().map(String::as_str) {
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    if kind == WriteKind::Create && record.id().is_some() && !fields.contains(&ID_FIELD) {
        fields.push(ID_FIELD);
    }

    fields
        .into_iter()
        .filter_map(|field| {
            let value = record.resolve(field)?;
            let mut filters = vec![Filter::eq(field, value.clone())];

            if kind == WriteKind::Update && field != ID_FIELD {
                if let Some(id) = record.id() {
                    filters.push(Filter::ne(ID_FIELD, id));
                }
            }

            Some(UnicityRule { field: field.to_string(), filters })
        })
        .filter(|rule| !(kind == WriteKind::Update && rule.field == ID_FIELD))
        .collect()
}

/// Checks the rules against a materialized set of records.
///
/// On collision, the error carries the conflicting record with the smallest id, so the
/// outcome does not depend on the order of `records`.
pub fn check_unicity<'r>(
    records: impl IntoIterator<Item = &'r Record> + Clone,
    record: &Record,
    unique_fields: &[String],
    kind: WriteKind,
) -> StorageResult<()> {
    for rule in unicity_rules(record, unique_fields, kind) {
        let existing = records
            .clone()
            .into_iter()
            .filter(|candidate| !candidate.is_deleted())
            .filter(|candidate| RecordEvaluator::matches_all(candidate, &rule.filters))
            .min_by(|a, b| a.id().cmp(&b.id()));

        if let Some(existing) = existing {
            return Err(StorageError::unicity(rule.field, existing.clone()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn update_rules_exclude_the_candidate() {
        let candidate = record(json!({"id": "a", "email": "x@y", "phone": null}));

        let rules = unicity_rules(&candidate, &fields(&["email", "phone", "email"]), WriteKind::Update);

        assert_eq!(
            rules,
            vec![UnicityRule {
                field: "email".to_string(),
                filters: vec![Filter::eq("email", "x@y"), Filter::ne("id", "a")],
            }]
        );
    }

    #[test]
    fn client_ids_are_unique_on_creation() {
        let candidate = record(json!({"id": "a"}));

        let rules = unicity_rules(&candidate, &[], WriteKind::Create);

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].filters, vec![Filter::eq("id", "a")]);
    }

    #[test]
    fn reports_the_conflicting_record() {
        let existing = vec![
            record(json!({"id": "1", "email": "x@y"})),
            record(json!({"id": "2", "email": "z@y"})),
        ];
        let candidate = record(json!({"email": "x@y"}));

        let err = check_unicity(&existing, &candidate, &fields(&["email"]), WriteKind::Create)
            .unwrap_err();

        match err {
            StorageError::Unicity { field, existing: conflicting } => {
                assert_eq!(field, "email");
                assert_eq!(conflicting.id(), Some("1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn tombstones_and_nulls_never_conflict() {
        let existing = vec![
            Record::tombstone("1", 10),
            record(json!({"id": "2", "email": null})),
        ];

        assert!(check_unicity(&existing, &record(json!({"id": "1"})), &[], WriteKind::Create).is_ok());
        assert!(
            check_unicity(&existing, &record(json!({"email": null})), &fields(&["email"]), WriteKind::Create)
                .is_ok()
        );
    }
}
