//! Storage error types.

use thiserror::Error;

/// Errors returned by object-store backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Object or prefix does not exist.
    #[error("Object not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The backend does not implement the requested primitive.
    #[error("Operation not supported by backend: {operation}")]
    Unsupported {
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// Directory marker cannot be removed while objects remain below it.
    #[error("Directory not empty: {prefix}")]
    DirectoryNotEmpty {
        /// The directory prefix.
        prefix: String,
    },

    /// Any other failure reported by the backend.
    #[error("{operation} failed for {key}: {message}")]
    Backend {
        /// Name of the failed operation.
        operation: &'static str,
        /// Key the operation targeted.
        key: String,
        /// Backend-provided message.
        message: String,
    },
}

impl StorageError {
    /// Build a `NotFound` error.
    ///
    /// # Arguments
    /// * `key` - The missing key
    pub fn not_found(key: impl Into<String>) -> Self {
        StorageError::NotFound { key: key.into() }
    }

    /// Check whether this error reports a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Check whether this error reports a missing backend primitive.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, StorageError::Unsupported { .. })
    }
}
