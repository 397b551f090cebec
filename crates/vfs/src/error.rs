//! Error types for the VFS crate.

use objmount_storage::StorageError;
use thiserror::Error;

use crate::write::WriteCacheError;

/// Errors that can occur during VFS operations.
///
/// Every variant maps to a POSIX error code through [`VfsError::errno`].
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create, mkdir or symlink on a name that already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has children.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Operation needs a non-directory but found a directory.
    #[error("Is a directory: {0}")]
    IsDirectory(String),

    /// Operation needs a directory but found something else.
    #[error("Not a directory: {0}")]
    NotDirectory(String),

    /// Backend lacks a primitive and no fallback applies.
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    /// Underlying object-store call failed.
    #[error("Backend failure: {0}")]
    Backend(#[from] StorageError),

    /// Cached node no longer matches backend state.
    #[error("Stale cache entry: {0}")]
    Stale(String),

    /// Symlink resolution exceeded the hop limit.
    #[error("Too many levels of symbolic links: {0}")]
    TooManyLinks(String),

    /// Malformed request (bad name, rename into own subtree, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Symlink object content is not a valid target.
    #[error("Invalid symlink target in {0}")]
    InvalidSymlink(String),

    /// Unknown or already released file handle.
    #[error("Bad file handle: {0}")]
    BadHandle(u64),

    /// Handle was not opened with the access the operation needs.
    #[error("Handle {0} not opened for this access mode")]
    AccessMode(u64),

    /// Write buffer failure.
    #[error("Write cache error: {0}")]
    WriteCache(#[from] WriteCacheError),
}

impl VfsError {
    /// POSIX error code for this error.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::AlreadyExists(_) => libc::EEXIST,
            VfsError::NotEmpty(_) => libc::ENOTEMPTY,
            VfsError::IsDirectory(_) => libc::EISDIR,
            VfsError::NotDirectory(_) => libc::ENOTDIR,
            VfsError::Unsupported(_) => libc::ENOSYS,
            VfsError::Backend(StorageError::NotFound { .. }) => libc::ENOENT,
            VfsError::Backend(_) => libc::EIO,
            VfsError::Stale(_) => libc::ESTALE,
            VfsError::TooManyLinks(_) => libc::ELOOP,
            VfsError::InvalidArgument(_) => libc::EINVAL,
            VfsError::InvalidSymlink(_) => libc::EIO,
            VfsError::BadHandle(_) | VfsError::AccessMode(_) => libc::EBADF,
            VfsError::WriteCache(WriteCacheError::TooLarge { .. }) => libc::EFBIG,
            VfsError::WriteCache(_) => libc::EIO,
        }
    }

    /// Check whether this error reports a missing path or object.
    pub fn is_not_found(&self) -> bool {
        match self {
            VfsError::NotFound(_) => true,
            VfsError::Backend(e) => e.is_not_found(),
            _ => false,
        }
    }
}
