//! Symlink inode implementation.

use std::any::Any;
use std::time::SystemTime;

use parking_lot::RwLock;

use super::types::{INode, INodeId, INodeLocation, INodeType};

/// Symlink permissions (always 0o777 - target determines access).
pub const SYMLINK_PERMS: u16 = 0o777;

/// Symlink inode representing a symbolic link.
///
/// The target is read from the backend object on first use; a link's target
/// never changes in place (replace it by unlink and recreate).
#[derive(Debug)]
pub struct INodeSymlink {
    /// Inode ID.
    id: INodeId,
    /// Parent, name and path.
    location: RwLock<INodeLocation>,
    /// Size of the backing object as listed.
    object_size: u64,
    /// Modification time.
    mtime: RwLock<SystemTime>,
    /// Target path, once loaded.
    target: RwLock<Option<String>>,
}

impl INodeSymlink {
    /// Create a new symlink inode.
    ///
    /// # Arguments
    /// * `id` - Inode ID
    /// * `location` - Parent, name and path
    /// * `object_size` - Size of the backing object
    /// * `mtime` - Modification time
    /// * `target` - Target path, if already known
    pub fn new(
        id: INodeId,
        location: INodeLocation,
        object_size: u64,
        mtime: SystemTime,
        target: Option<String>,
    ) -> Self {
        Self {
            id,
            location: RwLock::new(location),
            object_size,
            mtime: RwLock::new(mtime),
            target: RwLock::new(target),
        }
    }

    /// Get the symlink target path, if loaded.
    pub fn target(&self) -> Option<String> {
        self.target.read().clone()
    }

    /// Cache the decoded target.
    pub fn set_target(&self, target: String) {
        *self.target.write() = Some(target);
    }

    /// Update the modification time.
    pub fn set_mtime(&self, mtime: SystemTime) {
        *self.mtime.write() = mtime;
    }
}

impl INode for INodeSymlink {
    fn id(&self) -> INodeId {
        self.id
    }

    fn location(&self) -> INodeLocation {
        self.location.read().clone()
    }

    fn set_location(&self, location: INodeLocation) {
        *self.location.write() = location;
    }

    fn inode_type(&self) -> INodeType {
        INodeType::Symlink
    }

    /// Length of the target string once known, otherwise the object size.
    fn size(&self) -> u64 {
        match self.target.read().as_ref() {
            Some(t) => t.len() as u64,
            None => self.object_size,
        }
    }

    fn mtime(&self) -> SystemTime {
        *self.mtime.read()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
