//! Record identifier generation.

use std::{fmt::Debug, sync::Arc};

use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{StorageError, StorageResult},
    record::{ID_FIELD, Record},
};

/// Produces identifiers for new records and recognizes well-formed ones.
pub trait IdGenerator: Send + Sync + Debug {
    /// Generates a new identifier.
    fn generate(&self) -> String;

    /// Whether the given identifier has the expected format.
    fn matches(&self, id: &str) -> bool;
}

/// Random (v4) UUIDs in their hyphenated lowercase form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn matches(&self, id: &str) -> bool {
        id.len() == 36 && Uuid::try_parse(id).is_ok()
    }
}

/// Shared handle on an id generator.
pub type IdGeneratorRef = Arc<dyn IdGenerator>;

/// The default generator handle.
pub fn uuid_generator() -> IdGeneratorRef {
    Arc::new(UuidGenerator)
}

/// Checks once that a generator produces identifiers its own matcher accepts.
pub fn validate_generator(generator: &dyn IdGenerator) -> StorageResult<()> {
    let sample = generator.generate();

    if generator.matches(&sample) {
        Ok(())
    } else {
        Err(StorageError::Initialization(format!(
            "id generator produced {sample:?}, which does not match its own format"
        )))
    }
}

/// Generates an id for a record without one, or validates the one it carries.
pub fn assign_id(record: &mut Record, generator: &dyn IdGenerator) -> StorageResult<()> {
    match record.get(ID_FIELD) {
        Some(Value::String(id)) if generator.matches(id) => Ok(()),
        None | Some(Value::Null) => {
            record.set_id(generator.generate());
            Ok(())
        }
        Some(other) => Err(StorageError::InvalidRecord(format!(
            "invalid record id {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Broken;

    impl IdGenerator for Broken {
        fn generate(&self) -> String {
            "not-an-id".to_string()
        }

        fn matches(&self, id: &str) -> bool {
            id.starts_with("id-")
        }
    }

    #[test]
    fn uuid_generator_round_trips() {
        let generator = UuidGenerator;
        let id = generator.generate();

        assert!(generator.matches(&id));
        assert!(!generator.matches("abc"));
        assert!(!generator.matches("67e5504410b1426f9247bb680e5fe0c8"));
        assert!(validate_generator(&generator).is_ok());
    }

    #[test]
    fn rejects_generators_failing_their_own_format() {
        assert!(matches!(
            validate_generator(&Broken),
            Err(StorageError::Initialization(_))
        ));
    }

    #[test]
    fn assigns_or_validates_ids() {
        let mut fresh = Record::new();
        assign_id(&mut fresh, &UuidGenerator).unwrap();
        assert!(UuidGenerator.matches(fresh.id().unwrap()));

        let id = UuidGenerator.generate();
        let mut supplied = Record::from_value(json!({"id": id})).unwrap();
        assign_id(&mut supplied, &UuidGenerator).unwrap();
        assert_eq!(supplied.id(), Some(id.as_str()));

        let mut malformed = Record::from_value(json!({"id": 42})).unwrap();
        assert!(matches!(
            assign_id(&mut malformed, &UuidGenerator),
            Err(StorageError::InvalidRecord(_))
        ));
    }
}
