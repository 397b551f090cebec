//! Filesystem view of an object store.
//!
//! This crate turns a flat, key-addressed object store into a hierarchical
//! filesystem: directories are key prefixes, symlinks are ordinary objects
//! tagged with a reserved suffix, and writes are staged locally and uploaded
//! as whole objects when the last writer closes.
//!
//! # Architecture
//!
//! ```text
//! Layer 3: Vfs (path resolution, handles, per-path locks, stale retry)
//! Layer 2: DirectoryTree, ModTimeReconciler, WriteCache
//! Layer 1: Primitives (INodeManager, link codec, ObjectStore)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use objmount_storage::MemoryObjectStore;
//! use objmount_vfs::{OpenOptions, Vfs, VfsOptions};
//!
//! let vfs = Vfs::new(Arc::new(MemoryObjectStore::new()), VfsOptions::default())?;
//! let fh = vfs.create("notes.txt").await?;
//! vfs.write(fh, 0, b"hello").await?;
//! vfs.release(fh).await?;
//! vfs.symlink("notes.txt", "latest").await?;
//! ```

pub mod error;
pub mod handle;
pub mod inode;
pub mod link;
pub mod locks;
pub mod options;
pub mod path;
pub mod tree;
pub mod vfs;
pub mod write;

pub use error::VfsError;
pub use handle::{FileHandle, OpenOptions, WriteState};
pub use inode::{INode, INodeId, INodeType, ROOT_INODE};
pub use options::VfsOptions;
pub use tree::DirectoryTree;
pub use vfs::{DirEntry, FileAttr, Vfs, VfsStats};
pub use write::{
    MaterializedCache, MemoryWriteCache, ModTimeReconciler, TimeSetOutcome, WriteCache,
    WriteCacheError,
};

// Re-export the backend interface for convenience
pub use objmount_storage::{
    MemoryObjectStore, ObjectInfo, ObjectStore, StorageError, StoreCapabilities, StoreOp,
};
