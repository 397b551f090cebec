//! INode manager for allocating and tracking inodes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::path::{is_same_or_descendant, join};
use crate::VfsError;

use super::dir::INodeDir;
use super::file::INodeFile;
use super::symlink::INodeSymlink;
use super::types::{INode, INodeId, INodeLocation, INodeType, ROOT_INODE};

/// Attributes for an inode about to be inserted.
#[derive(Debug, Clone)]
pub enum NewINode {
    /// Directory.
    Directory {
        /// Modification time.
        mtime: SystemTime,
    },
    /// Regular file.
    File {
        /// Size in bytes.
        size: u64,
        /// Modification time.
        mtime: SystemTime,
        /// Whether a backend object already exists.
        flushed: bool,
    },
    /// Symlink.
    Symlink {
        /// Size of the backing object.
        object_size: u64,
        /// Modification time.
        mtime: SystemTime,
        /// Target, if already known.
        target: Option<String>,
    },
}

impl NewINode {
    /// Type of inode this will create.
    pub fn inode_type(&self) -> INodeType {
        match self {
            NewINode::Directory { .. } => INodeType::Directory,
            NewINode::File { .. } => INodeType::File,
            NewINode::Symlink { .. } => INodeType::Symlink,
        }
    }
}

/// Outcome of [`INodeManager::sync_children`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    /// New entries.
    pub inserted: usize,
    /// Entries whose attributes were refreshed in place.
    pub updated: usize,
    /// Entries replaced because their type or content changed.
    pub replaced: usize,
    /// Entries no longer present on the backend.
    pub removed: usize,
}

struct INodeTables {
    /// All inodes by ID.
    inodes: HashMap<INodeId, Arc<dyn INode>>,
    /// Path to inode ID index.
    path_index: HashMap<String, INodeId>,
}

/// Manages inode allocation and lookup.
///
/// Holds the in-memory namespace. Every structural change (insert, remove,
/// relocate) happens under one write lock, so a reader taking a directory
/// snapshot never observes half of a mutation.
pub struct INodeManager {
    /// Next inode ID to allocate.
    next_id: AtomicU64,
    /// Root directory.
    root: Arc<dyn INode>,
    /// ID and path indices.
    tables: RwLock<INodeTables>,
}

impl INodeManager {
    /// Create a new inode manager with root directory.
    pub fn new() -> Self {
        let root: Arc<dyn INode> = Arc::new(INodeDir::new(
            ROOT_INODE,
            INodeLocation::new(ROOT_INODE, "", ""),
            SystemTime::now(),
        ));

        let mut inodes: HashMap<INodeId, Arc<dyn INode>> = HashMap::new();
        inodes.insert(ROOT_INODE, root.clone());
        let mut path_index: HashMap<String, INodeId> = HashMap::new();
        path_index.insert(String::new(), ROOT_INODE);

        Self {
            next_id: AtomicU64::new(ROOT_INODE + 1),
            root,
            tables: RwLock::new(INodeTables { inodes, path_index }),
        }
    }

    /// Allocate a new inode ID.
    fn allocate_id(&self) -> INodeId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Get an inode by ID.
    pub fn get(&self, id: INodeId) -> Option<Arc<dyn INode>> {
        self.tables.read().inodes.get(&id).cloned()
    }

    /// Get an inode by path (empty string for root).
    pub fn get_by_path(&self, path: &str) -> Option<Arc<dyn INode>> {
        let tables = self.tables.read();
        let id: INodeId = *tables.path_index.get(path)?;
        tables.inodes.get(&id).cloned()
    }

    /// Get the root directory.
    pub fn root(&self) -> Arc<dyn INode> {
        self.root.clone()
    }

    /// Get a named child of a directory.
    pub fn child(&self, dir_id: INodeId, name: &str) -> Option<Arc<dyn INode>> {
        let tables = self.tables.read();
        let dir: &Arc<dyn INode> = tables.inodes.get(&dir_id)?;
        let child_id: INodeId = dir.as_dir()?.get_child(name)?;
        tables.inodes.get(&child_id).cloned()
    }

    /// Snapshot of a directory's children, ordered by name.
    ///
    /// # Returns
    /// None if the inode is missing or not a directory.
    pub fn children(&self, dir_id: INodeId) -> Option<Vec<Arc<dyn INode>>> {
        let tables = self.tables.read();
        let dir: &Arc<dyn INode> = tables.inodes.get(&dir_id)?;
        let entries: Vec<(String, INodeId)> = dir.as_dir()?.children();
        Some(
            entries
                .into_iter()
                .filter_map(|(_, id)| tables.inodes.get(&id).cloned())
                .collect(),
        )
    }

    /// Insert a new inode under a directory.
    ///
    /// # Arguments
    /// * `parent_id` - Parent directory inode ID
    /// * `name` - Logical entry name
    /// * `new` - Type and attributes of the new inode
    ///
    /// # Returns
    /// The inserted inode.
    pub fn insert(
        &self,
        parent_id: INodeId,
        name: &str,
        new: NewINode,
    ) -> Result<Arc<dyn INode>, VfsError> {
        let mut tables = self.tables.write();
        self.insert_locked(&mut tables, parent_id, name, new)
    }

    fn insert_locked(
        &self,
        tables: &mut INodeTables,
        parent_id: INodeId,
        name: &str,
        new: NewINode,
    ) -> Result<Arc<dyn INode>, VfsError> {
        let parent: Arc<dyn INode> = tables
            .inodes
            .get(&parent_id)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("inode {}", parent_id)))?;
        let parent_dir: &INodeDir = parent
            .as_dir()
            .ok_or_else(|| VfsError::NotDirectory(parent.path()))?;

        let path: String = join(&parent.path(), name);
        if parent_dir.get_child(name).is_some() {
            return Err(VfsError::AlreadyExists(path));
        }

        let id: INodeId = self.allocate_id();
        let location: INodeLocation = INodeLocation::new(parent_id, name, path.clone());
        let node: Arc<dyn INode> = match new {
            NewINode::Directory { mtime } => Arc::new(INodeDir::new(id, location, mtime)),
            NewINode::File {
                size,
                mtime,
                flushed,
            } => Arc::new(INodeFile::new(id, location, size, mtime, flushed)),
            NewINode::Symlink {
                object_size,
                mtime,
                target,
            } => Arc::new(INodeSymlink::new(id, location, object_size, mtime, target)),
        };

        parent_dir.add_child(name.to_string(), id);
        tables.inodes.insert(id, node.clone());
        tables.path_index.insert(path, id);

        Ok(node)
    }

    /// Remove an inode and, for directories, everything below it.
    pub fn remove(&self, id: INodeId) -> Result<(), VfsError> {
        if id == ROOT_INODE {
            return Err(VfsError::InvalidArgument("cannot remove root".to_string()));
        }

        let mut tables = self.tables.write();
        Self::remove_locked(&mut tables, id)
    }

    fn remove_locked(tables: &mut INodeTables, id: INodeId) -> Result<(), VfsError> {
        let node: Arc<dyn INode> = tables
            .inodes
            .get(&id)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("inode {}", id)))?;

        let location: INodeLocation = node.location();
        if let Some(parent) = tables.inodes.get(&location.parent_id) {
            if let Some(parent_dir) = parent.as_dir() {
                if parent_dir.get_child(&location.name) == Some(id) {
                    parent_dir.remove_child(&location.name);
                }
            }
        }

        let mut stack: Vec<Arc<dyn INode>> = vec![node];
        while let Some(current) = stack.pop() {
            if let Some(dir) = current.as_dir() {
                for (_, child_id) in dir.children() {
                    if let Some(child) = tables.inodes.get(&child_id) {
                        stack.push(child.clone());
                    }
                }
            }
            let current_id: INodeId = current.id();
            let current_path: String = current.path();
            tables.inodes.remove(&current_id);
            if tables.path_index.get(&current_path) == Some(&current_id) {
                tables.path_index.remove(&current_path);
            }
        }

        Ok(())
    }

    /// Replace a directory's children with the result of a backend listing.
    ///
    /// Existing inodes keep their IDs when the listed entry has the same
    /// type. Files with open writers are left untouched: their local state
    /// is newer than anything the backend can report.
    ///
    /// # Arguments
    /// * `dir_id` - Directory that was listed
    /// * `listed` - Entries by logical name
    ///
    /// # Returns
    /// Counts of inserted, updated and removed entries.
    pub fn sync_children(
        &self,
        dir_id: INodeId,
        mut listed: BTreeMap<String, NewINode>,
    ) -> Result<SyncSummary, VfsError> {
        let mut tables = self.tables.write();
        let dir: Arc<dyn INode> = tables
            .inodes
            .get(&dir_id)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("inode {}", dir_id)))?;
        let dir_node: &INodeDir = dir
            .as_dir()
            .ok_or_else(|| VfsError::NotDirectory(dir.path()))?;

        let mut summary: SyncSummary = SyncSummary::default();
        for (name, child_id) in dir_node.children() {
            let child: Arc<dyn INode> = match tables.inodes.get(&child_id) {
                Some(child) => child.clone(),
                None => continue,
            };

            if let Some(file) = child.as_file() {
                if file.has_writers() {
                    listed.remove(&name);
                    continue;
                }
            }

            match listed.remove(&name) {
                Some(entry) if entry.inode_type() == child.inode_type() => {
                    if Self::refresh_attrs(&child, &entry) {
                        summary.updated += 1;
                    } else {
                        Self::remove_locked(&mut tables, child_id)?;
                        self.insert_locked(&mut tables, dir_id, &name, entry)?;
                        summary.replaced += 1;
                    }
                }
                Some(entry) => {
                    Self::remove_locked(&mut tables, child_id)?;
                    self.insert_locked(&mut tables, dir_id, &name, entry)?;
                    summary.replaced += 1;
                }
                None => {
                    Self::remove_locked(&mut tables, child_id)?;
                    summary.removed += 1;
                }
            }
        }

        for (name, entry) in listed {
            self.insert_locked(&mut tables, dir_id, &name, entry)?;
            summary.inserted += 1;
        }

        Ok(summary)
    }

    /// Apply listed attributes to an inode of the same type.
    ///
    /// # Returns
    /// False when the inode must be replaced instead.
    fn refresh_attrs(node: &Arc<dyn INode>, entry: &NewINode) -> bool {
        match entry {
            NewINode::Directory { .. } => true,
            NewINode::File { size, mtime, .. } => match node.as_file() {
                Some(file) => {
                    file.mark_flushed(*size, *mtime);
                    true
                }
                None => false,
            },
            NewINode::Symlink {
                object_size, mtime, ..
            } => match node.as_symlink() {
                // A changed object size means the link was recreated
                // elsewhere; drop the cached target with the inode.
                Some(link) if link.size() == *object_size => {
                    link.set_mtime(*mtime);
                    true
                }
                _ => false,
            },
        }
    }

    /// Move an inode under a new parent and name, re-keying its subtree.
    ///
    /// # Arguments
    /// * `id` - Inode to move
    /// * `new_parent_id` - Destination directory
    /// * `new_name` - Destination name (must be free)
    pub fn relocate(
        &self,
        id: INodeId,
        new_parent_id: INodeId,
        new_name: &str,
    ) -> Result<(), VfsError> {
        if id == ROOT_INODE {
            return Err(VfsError::InvalidArgument("cannot move root".to_string()));
        }

        let mut tables = self.tables.write();
        let node: Arc<dyn INode> = tables
            .inodes
            .get(&id)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("inode {}", id)))?;
        let new_parent: Arc<dyn INode> = tables
            .inodes
            .get(&new_parent_id)
            .cloned()
            .ok_or_else(|| VfsError::NotFound(format!("inode {}", new_parent_id)))?;
        let new_parent_dir: &INodeDir = new_parent
            .as_dir()
            .ok_or_else(|| VfsError::NotDirectory(new_parent.path()))?;

        let old: INodeLocation = node.location();
        let new_path: String = join(&new_parent.path(), new_name);

        if node.inode_type() == INodeType::Directory
            && is_same_or_descendant(&old.path, &new_parent.path())
        {
            return Err(VfsError::InvalidArgument(format!(
                "cannot move {} into itself",
                old.path
            )));
        }
        if new_parent_dir.get_child(new_name).is_some() {
            return Err(VfsError::AlreadyExists(new_path));
        }

        if let Some(old_parent) = tables.inodes.get(&old.parent_id) {
            if let Some(old_parent_dir) = old_parent.as_dir() {
                old_parent_dir.remove_child(&old.name);
            }
        }
        new_parent_dir.add_child(new_name.to_string(), id);

        let mut pending: Vec<(Arc<dyn INode>, INodeLocation)> =
            vec![(node, INodeLocation::new(new_parent_id, new_name, new_path))];
        while let Some((current, location)) = pending.pop() {
            let current_id: INodeId = current.id();
            let old_path: String = current.path();
            if tables.path_index.get(&old_path) == Some(&current_id) {
                tables.path_index.remove(&old_path);
            }
            tables.path_index.insert(location.path.clone(), current_id);

            if let Some(dir) = current.as_dir() {
                for (child_name, child_id) in dir.children() {
                    if let Some(child) = tables.inodes.get(&child_id) {
                        let child_path: String = join(&location.path, &child_name);
                        pending.push((
                            child.clone(),
                            INodeLocation::new(current_id, child_name, child_path),
                        ));
                    }
                }
            }
            current.set_location(location);
        }

        Ok(())
    }

    /// Get the total number of inodes.
    pub fn inode_count(&self) -> usize {
        self.tables.read().inodes.len()
    }
}

impl Default for INodeManager {
    fn default() -> Self {
        Self::new()
    }
}
