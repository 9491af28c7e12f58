//! Records, tombstones and scopes.
//!
//! A [`Record`] is a JSON object stored inside a [`Scope`]. The storage layer owns two of
//! its fields: `id` (assigned on creation when absent) and `last_modified` (reassigned on
//! every write). Deleting a record leaves a tombstone behind, a record that only carries
//! `id`, `last_modified` and `deleted: true`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};

/// Name of the identifier field.
pub const ID_FIELD: &str = "id";
/// Name of the revision timestamp field.
pub const MODIFIED_FIELD: &str = "last_modified";
/// Name of the deletion marker field carried by tombstones.
pub const DELETED_FIELD: &str = "deleted";

/// The `(collection_id, owner_id)` pair isolating one logical collection of records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    /// The collection (resource) name.
    pub collection_id: String,
    /// The owner of the records.
    pub owner_id: String,
}

impl Scope {
    pub fn new(collection_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            owner_id: owner_id.into(),
        }
    }

    /// A flat key for key/value backends: `<collection_id>.<owner_id>`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.collection_id, self.owner_id)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_id, self.owner_id)
    }
}

/// A JSON record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builds a record from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> StorageResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StorageError::InvalidRecord(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Builds a tombstone for the given id and deletion timestamp.
    pub fn tombstone(id: impl Into<String>, last_modified: i64) -> Self {
        let mut record = Self::new();
        record.set_id(id);
        record.set_last_modified(last_modified);
        record.insert(DELETED_FIELD, Value::Bool(true));
        record
    }

    /// The record identifier, if it carries a string `id`.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    /// The revision timestamp assigned by storage.
    pub fn last_modified(&self) -> Option<i64> {
        self.0.get(MODIFIED_FIELD).and_then(Value::as_i64)
    }

    pub fn set_last_modified(&mut self, last_modified: i64) {
        self.0
            .insert(MODIFIED_FIELD.to_string(), Value::from(last_modified));
    }

    /// Whether this record is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self.0.get(DELETED_FIELD), Some(Value::Bool(true)))
    }

    /// Strips everything but `id` and `last_modified`, and marks the record deleted.
    pub fn into_tombstone(self) -> Self {
        Self::tombstone(
            self.id().unwrap_or_default().to_string(),
            self.last_modified().unwrap_or_default(),
        )
    }

    /// Drops the fields only storage may set, before a write assigns them again.
    pub fn strip_storage_fields(&mut self) {
        self.0.remove(MODIFIED_FIELD);
        self.0.remove(DELETED_FIELD);
    }

    /// Resolves a possibly dotted field path (`"author.name"`).
    ///
    /// JSON `null` resolves to `None`, like a missing field.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(path) {
            return non_null(value);
        }

        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        non_null(current)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn non_null(value: &Value) -> Option<&Value> {
    match value {
        Value::Null => None,
        other => Some(other),
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

impl TryFrom<Value> for Record {
    type Error = StorageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Record::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn tombstone_keeps_only_id_and_timestamp() {
        let original = record(json!({
            "id": "abc",
            "last_modified": 42,
            "title": "secret",
        }));

        let tombstone = original.into_tombstone();

        assert_eq!(
            tombstone.into_value(),
            json!({"id": "abc", "last_modified": 42, "deleted": true})
        );
    }

    #[test]
    fn resolve_walks_nested_objects() {
        let r = record(json!({"author": {"name": "Ada"}, "empty": null}));

        assert_eq!(r.resolve("author.name"), Some(&json!("Ada")));
        assert_eq!(r.resolve("author.age"), None);
        assert_eq!(r.resolve("empty"), None);
        assert_eq!(r.resolve("missing.deeper"), None);
    }

    #[test]
    fn literal_dotted_keys_win_over_paths() {
        let r = record(json!({"a.b": 1, "a": {"b": 2}}));

        assert_eq!(r.resolve("a.b"), Some(&json!(1)));
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(matches!(
            Record::from_value(json!([1, 2])),
            Err(StorageError::InvalidRecord(_))
        ));
    }
}
