//! Directory inode implementation.

use std::any::Any;
use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::RwLock;

use super::types::{INode, INodeId, INodeLocation, INodeType};

/// Directory inode.
///
/// Children are kept ordered by name so listings are byte-wise sorted and
/// stable across calls.
#[derive(Debug)]
pub struct INodeDir {
    /// Inode ID.
    id: INodeId,
    /// Parent, name and path.
    location: RwLock<INodeLocation>,
    /// Child entries: name → inode ID.
    children: RwLock<BTreeMap<String, INodeId>>,
    /// Modification time.
    mtime: RwLock<SystemTime>,
    /// When the children were last populated from the backend.
    listed_at: RwLock<Option<Instant>>,
}

impl INodeDir {
    /// Create a new directory inode.
    ///
    /// # Arguments
    /// * `id` - Inode ID
    /// * `location` - Parent, name and path
    /// * `mtime` - Modification time
    pub fn new(id: INodeId, location: INodeLocation, mtime: SystemTime) -> Self {
        Self {
            id,
            location: RwLock::new(location),
            children: RwLock::new(BTreeMap::new()),
            mtime: RwLock::new(mtime),
            listed_at: RwLock::new(None),
        }
    }

    /// Add a child entry to this directory.
    pub fn add_child(&self, name: String, id: INodeId) {
        self.children.write().insert(name, id);
    }

    /// Get a child inode ID by name.
    pub fn get_child(&self, name: &str) -> Option<INodeId> {
        self.children.read().get(name).copied()
    }

    /// Snapshot of all children as (name, inode_id) pairs, ordered by name.
    pub fn children(&self) -> Vec<(String, INodeId)> {
        self.children
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Get the number of children.
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Remove a child entry from this directory.
    ///
    /// # Returns
    /// The removed child inode ID, or None if not found.
    pub fn remove_child(&self, name: &str) -> Option<INodeId> {
        self.children.write().remove(name)
    }

    /// Update the modification time.
    pub fn set_mtime(&self, mtime: SystemTime) {
        *self.mtime.write() = mtime;
    }

    /// Record that the children now match a fresh backend listing.
    pub fn mark_listed(&self) {
        *self.listed_at.write() = Some(Instant::now());
    }

    /// Forget the last listing so the next access re-reads the backend.
    pub fn invalidate(&self) {
        *self.listed_at.write() = None;
    }

    /// Check whether the children have ever been populated.
    pub fn is_listed(&self) -> bool {
        self.listed_at.read().is_some()
    }

    /// Check whether the last listing is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        match *self.listed_at.read() {
            Some(at) => at.elapsed() < ttl,
            None => false,
        }
    }
}

impl INode for INodeDir {
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
        INodeType::Directory
    }

    fn size(&self) -> u64 {
        0
    }

    fn mtime(&self) -> SystemTime {
        *self.mtime.read()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
