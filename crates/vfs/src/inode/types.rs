//! Core INode types and traits.

use std::any::Any;
use std::time::SystemTime;

use crate::link;

use super::dir::INodeDir;
use super::file::INodeFile;
use super::symlink::INodeSymlink;

/// Unique identifier for an inode.
pub type INodeId = u64;

/// Root directory inode ID (always 1 per FUSE convention).
pub const ROOT_INODE: INodeId = 1;

/// Type of inode entry. Fixed for the lifetime of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum INodeType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Where an inode sits in the tree. Changes on rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct INodeLocation {
    /// Parent directory inode ID (root is its own parent).
    pub parent_id: INodeId,
    /// Logical entry name.
    pub name: String,
    /// Full logical path from root.
    pub path: String,
}

impl INodeLocation {
    /// Create a location.
    pub fn new(parent_id: INodeId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            parent_id,
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Common trait for all inode types.
pub trait INode: Send + Sync + std::fmt::Debug {
    /// Get the inode ID.
    fn id(&self) -> INodeId;

    /// Get the current location.
    fn location(&self) -> INodeLocation;

    /// Move the inode to a new location.
    fn set_location(&self, location: INodeLocation);

    /// Get the inode type.
    fn inode_type(&self) -> INodeType;

    /// Get the size in bytes.
    fn size(&self) -> u64;

    /// Get the modification time.
    fn mtime(&self) -> SystemTime;

    /// Downcast to Any for type-safe downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Get the parent inode ID.
    fn parent_id(&self) -> INodeId {
        self.location().parent_id
    }

    /// Get the entry name.
    fn name(&self) -> String {
        self.location().name
    }

    /// Get the full path from root.
    fn path(&self) -> String {
        self.location().path
    }

    /// Key (or prefix, for directories) of the backing object.
    fn backend_key(&self) -> String {
        backend_key_for(self.inode_type(), &self.path())
    }

    /// Downcast to a directory.
    fn as_dir(&self) -> Option<&INodeDir> {
        self.as_any().downcast_ref::<INodeDir>()
    }

    /// Downcast to a file.
    fn as_file(&self) -> Option<&INodeFile> {
        self.as_any().downcast_ref::<INodeFile>()
    }

    /// Downcast to a symlink.
    fn as_symlink(&self) -> Option<&INodeSymlink> {
        self.as_any().downcast_ref::<INodeSymlink>()
    }
}

/// Backend key for an entry of the given type at a logical path.
///
/// Directories map to a `/`-terminated prefix (empty for the root), files to
/// their path, and symlinks to their path plus the link suffix.
pub fn backend_key_for(inode_type: INodeType, path: &str) -> String {
    match inode_type {
        INodeType::Directory if path.is_empty() => String::new(),
        INodeType::Directory => format!("{}/", path),
        INodeType::File => path.to_string(),
        INodeType::Symlink => link::to_backend_name(path),
    }
}
