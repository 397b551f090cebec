//! Object-store trait consumed by the VFS.

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::StorageError;

/// Information about one entry from a delimited listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full object key, or the prefix (with trailing `/`) for directories.
    pub key: String,
    /// Object size in bytes (0 for prefixes).
    pub size: u64,
    /// Last modified time as recorded by the backend.
    pub mod_time: Option<SystemTime>,
    /// True if this entry is a sub-prefix rather than an object.
    pub is_prefix: bool,
}

impl ObjectInfo {
    /// Create info for an object.
    ///
    /// # Arguments
    /// * `key` - Object key
    /// * `size` - Object size in bytes
    /// * `mod_time` - Backend modification time
    pub fn object(key: impl Into<String>, size: u64, mod_time: Option<SystemTime>) -> Self {
        Self {
            key: key.into(),
            size,
            mod_time,
            is_prefix: false,
        }
    }

    /// Create info for a sub-prefix.
    ///
    /// # Arguments
    /// * `key` - Prefix including its trailing `/`
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            mod_time: None,
            is_prefix: true,
        }
    }

    /// Last path component of the key, without any trailing `/`.
    pub fn leaf_name(&self) -> &str {
        let trimmed: &str = self.key.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

/// Optional primitives a backend may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Backend can rename an object server-side in one step.
    pub server_side_move: bool,
    /// `put` honours the caller-supplied modification time.
    pub mod_time_on_put: bool,
    /// `set_mod_time` can update an existing object's time.
    pub set_mod_time: bool,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            server_side_move: true,
            mod_time_on_put: true,
            set_mod_time: true,
        }
    }
}

/// Flat, key-addressed object storage.
///
/// Keys are `/`-separated. Directory prefixes end in `/`; the root prefix is
/// the empty string.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Report which optional primitives are available.
    fn capabilities(&self) -> StoreCapabilities;

    /// List the direct children of a prefix, sorted by key.
    ///
    /// # Arguments
    /// * `prefix` - Directory prefix (empty for root, otherwise ending in `/`)
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Download an object's full content.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Upload an object, replacing any existing content.
    ///
    /// # Arguments
    /// * `key` - Object key
    /// * `data` - Full content
    /// * `mod_time` - Desired modification time, honoured only when
    ///   `capabilities().mod_time_on_put` is set
    ///
    /// # Returns
    /// Info for the stored object as the backend recorded it.
    async fn put(
        &self,
        key: &str,
        data: &[u8],
        mod_time: Option<SystemTime>,
    ) -> Result<ObjectInfo, StorageError>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Rename an object server-side.
    ///
    /// Returns `StorageError::Unsupported` when the backend has no atomic move.
    async fn move_object(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let _ = (src, dst);
        Err(StorageError::Unsupported {
            operation: "move",
        })
    }

    /// Update an existing object's modification time.
    async fn set_mod_time(&self, key: &str, mod_time: SystemTime) -> Result<(), StorageError> {
        let _ = (key, mod_time);
        Err(StorageError::Unsupported {
            operation: "set_mod_time",
        })
    }

    /// Create an explicit directory marker.
    ///
    /// Backends without directory markers may treat this as a no-op.
    async fn create_dir(&self, prefix: &str) -> Result<(), StorageError>;

    /// Remove an explicit directory marker.
    ///
    /// Fails with `DirectoryNotEmpty` while objects remain below the prefix.
    async fn remove_dir(&self, prefix: &str) -> Result<(), StorageError>;
}
