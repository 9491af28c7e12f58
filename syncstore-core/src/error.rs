//! Error types and result types for storage operations.
//!
//! Every backend reports failures through [`StorageError`]. Backend-native error types
//! never cross the [`StorageBackend`](crate::backend::StorageBackend) boundary: they are
//! wrapped into [`StorageError::Backend`], which keeps the original error as its source.

use std::{error::Error as StdError, fmt};

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

use crate::record::Record;

/// Represents all possible errors that can occur when interacting with a record store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The requested record does not exist in the scope, or has been deleted.
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    /// A unique field collides with an existing, non-deleted record.
    ///
    /// The existing record is carried in full so callers can answer with it instead of
    /// failing the write.
    #[error("Unicity constraint violated on field {field}")]
    Unicity {
        /// The field whose value collides.
        field: String,
        /// The record already holding that value.
        existing: Box<Record>,
    },
    /// A transient failure of the underlying storage service.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// A write was attempted against a read-only store.
    #[error("Read-only store: {0}")]
    Readonly(String),
    /// The record cannot be stored as given.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
}

impl StorageError {
    /// Wraps any backend-native error into [`StorageError::Backend`].
    pub fn backend<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        StorageError::Backend(BackendError::new(err))
    }

    /// Builds a [`StorageError::Backend`] from a plain message.
    pub fn backend_message(message: impl Into<String>) -> Self {
        StorageError::Backend(BackendError::from_message(message))
    }

    /// Builds a [`StorageError::Unicity`] for the given field and conflicting record.
    pub fn unicity(field: impl Into<String>, existing: Record) -> Self {
        StorageError::Unicity {
            field: field.into(),
            existing: Box::new(existing),
        }
    }

    /// Returns `true` for [`StorageError::RecordNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::RecordNotFound(_))
    }

    /// Returns `true` for [`StorageError::Backend`].
    pub fn is_backend(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

/// A specialized `Result` type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// An infrastructure failure, holding the backend's original error for diagnostics.
#[derive(Debug)]
pub struct BackendError {
    original: Box<dyn StdError + Send + Sync + 'static>,
}

impl BackendError {
    /// Wraps the original error.
    pub fn new<E>(original: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self { original: Box::new(original) }
    }

    /// Creates a backend error that has no underlying native error.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self { original: message.into().into() }
    }

    /// The original error reported by the backend.
    pub fn original(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.original.as_ref()
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend error: {}", self.original)
    }
}

impl StdError for BackendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.original.as_ref())
    }
}

impl From<BsonError> for StorageError {
    fn from(err: BsonError) -> Self {
        StorageError::InvalidRecord(err.to_string())
    }
}

impl From<SerdeJsonError> for StorageError {
    fn from(err: SerdeJsonError) -> Self {
        StorageError::InvalidRecord(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn backend_error_keeps_original_cause() {
        let err = StorageError::backend(io::Error::new(io::ErrorKind::TimedOut, "socket timeout"));

        let StorageError::Backend(inner) = &err else {
            panic!("expected a backend error");
        };
        assert_eq!(inner.original().to_string(), "socket timeout");
        assert_eq!(err.to_string(), "Backend error: socket timeout");
        assert!(StdError::source(&err).is_some());
    }
}
