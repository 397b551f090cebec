//! INode primitives for the virtual filesystem.
//!
//! This module provides the core data structures for representing files,
//! directories, and symlinks as a cache of backend state.

mod dir;
mod file;
mod manager;
mod symlink;
mod types;

pub use dir::INodeDir;
pub use file::INodeFile;
pub use manager::{INodeManager, NewINode, SyncSummary};
pub use symlink::{INodeSymlink, SYMLINK_PERMS};
pub use types::{backend_key_for, INode, INodeId, INodeLocation, INodeType, ROOT_INODE};
