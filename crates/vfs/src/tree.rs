//! Directory tree backed by an object store.
//!
//! Directory contents are filled lazily from backend listings and re-read
//! once older than the configured cache time. Every mutation is sent to the
//! backend first; the tree changes only after the backend confirms, so a
//! failed call leaves the cached namespace as it was.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use objmount_storage::{ObjectInfo, ObjectStore, StorageError, StoreCapabilities};

use crate::inode::{
    backend_key_for, INode, INodeManager, INodeType, NewINode, SyncSummary,
};
use crate::link;
use crate::options::VfsOptions;
use crate::path::join;
use crate::VfsError;

/// Objects and directory prefixes found below a prefix.
struct PrefixWalk {
    objects: Vec<ObjectInfo>,
    /// Sub-prefixes, each listed after its parent.
    dirs: Vec<String>,
}

/// Cached namespace over an [`ObjectStore`].
pub struct DirectoryTree {
    inodes: INodeManager,
    store: Arc<dyn ObjectStore>,
    links: bool,
    dir_cache_time: Duration,
    /// Reported for directories, which carry no backend time.
    mount_time: SystemTime,
}

impl DirectoryTree {
    /// Create a tree with only the root, unlisted.
    ///
    /// # Arguments
    /// * `store` - Backend holding the objects
    /// * `options` - Link translation and cache lifetime
    pub fn new(store: Arc<dyn ObjectStore>, options: &VfsOptions) -> Self {
        let inodes: INodeManager = INodeManager::new();
        let mount_time: SystemTime = inodes.root().mtime();
        Self {
            inodes,
            store,
            links: options.links,
            dir_cache_time: options.dir_cache_time(),
            mount_time,
        }
    }

    /// Inode table.
    pub fn inodes(&self) -> &INodeManager {
        &self.inodes
    }

    /// Backend store.
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Backend capabilities.
    pub fn capabilities(&self) -> StoreCapabilities {
        self.store.capabilities()
    }

    /// Whether tagged objects are presented as symlinks.
    pub fn links_enabled(&self) -> bool {
        self.links
    }

    /// Resolve a path without following any symlink.
    ///
    /// A symlink in a non-final position fails with `NotDirectory`; callers
    /// that need link traversal resolve component by component with
    /// [`DirectoryTree::child`].
    pub async fn lookup(&self, path: &str) -> Result<Arc<dyn INode>, VfsError> {
        let mut current: Arc<dyn INode> = self.inodes.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if current.inode_type() != INodeType::Directory {
                return Err(VfsError::NotDirectory(current.path()));
            }
            current = self
                .child(&current, component)
                .await?
                .ok_or_else(|| VfsError::NotFound(join(&current.path(), component)))?;
        }
        Ok(current)
    }

    /// Look up one entry of a directory, listing it first if needed.
    pub async fn child(
        &self,
        dir: &Arc<dyn INode>,
        name: &str,
    ) -> Result<Option<Arc<dyn INode>>, VfsError> {
        self.ensure_listed(dir).await?;
        Ok(self.inodes.child(dir.id(), name))
    }

    /// Entries of a directory, ordered by name.
    pub async fn list(&self, dir: &Arc<dyn INode>) -> Result<Vec<Arc<dyn INode>>, VfsError> {
        self.ensure_listed(dir).await?;
        Ok(self.inodes.children(dir.id()).unwrap_or_default())
    }

    /// List a directory from the backend unless its listing is still fresh.
    pub async fn ensure_listed(&self, dir: &Arc<dyn INode>) -> Result<(), VfsError> {
        let dir_node = dir
            .as_dir()
            .ok_or_else(|| VfsError::NotDirectory(dir.path()))?;
        if dir_node.is_fresh(self.dir_cache_time) {
            return Ok(());
        }
        self.refresh(dir).await.map(|_| ())
    }

    /// Re-read a directory from the backend and merge the result.
    ///
    /// # Returns
    /// What changed in the cached children.
    pub async fn refresh(&self, dir: &Arc<dyn INode>) -> Result<SyncSummary, VfsError> {
        let dir_node = dir
            .as_dir()
            .ok_or_else(|| VfsError::NotDirectory(dir.path()))?;
        let dir_path: String = dir.path();
        let prefix: String = dir.backend_key();

        let entries: Vec<ObjectInfo> = match self.store.list(&prefix).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() && !dir_path.is_empty() => {
                // Only local writers can keep a vanished directory alive.
                let summary: SyncSummary = self.inodes.sync_children(dir.id(), BTreeMap::new())?;
                if dir_node.child_count() == 0 {
                    tracing::debug!("Directory {} vanished from backend", dir_path);
                    if self.inodes.get(dir.id()).is_some() {
                        self.inodes.remove(dir.id())?;
                    }
                    return Err(VfsError::NotFound(dir_path));
                }
                dir_node.mark_listed();
                return Ok(summary);
            }
            Err(e) => return Err(e.into()),
        };

        let listed: BTreeMap<String, NewINode> = self.listed_entries(&dir_path, entries);
        let summary: SyncSummary = self.inodes.sync_children(dir.id(), listed)?;
        dir_node.mark_listed();

        tracing::debug!(
            "Listed {:?}: +{} ~{} !{} -{}",
            dir_path,
            summary.inserted,
            summary.updated,
            summary.replaced,
            summary.removed
        );
        Ok(summary)
    }

    /// Turn backend entries into logical children.
    ///
    /// Directories win over objects of the same name, and regular objects
    /// win over links of the same logical name.
    fn listed_entries(&self, dir_path: &str, entries: Vec<ObjectInfo>) -> BTreeMap<String, NewINode> {
        let mut listed: BTreeMap<String, NewINode> = BTreeMap::new();

        for info in entries {
            let leaf: &str = info.leaf_name();
            if leaf.is_empty() {
                continue;
            }

            if info.is_prefix {
                if listed.contains_key(leaf) {
                    tracing::warn!(
                        "Directory {} hides an object of the same name",
                        join(dir_path, leaf)
                    );
                }
                listed.insert(
                    leaf.to_string(),
                    NewINode::Directory {
                        mtime: self.mount_time,
                    },
                );
                continue;
            }

            let mtime: SystemTime = info.mod_time.unwrap_or(self.mount_time);
            if self.links && link::is_symlink_object_name(leaf) {
                let name: &str = link::to_logical_name(leaf);
                match listed.get(name) {
                    Some(NewINode::File { .. }) | Some(NewINode::Directory { .. }) => {
                        tracing::warn!(
                            "Ignoring link {}: a regular entry has the same name",
                            info.key
                        );
                    }
                    _ => {
                        listed.insert(
                            name.to_string(),
                            NewINode::Symlink {
                                object_size: info.size,
                                mtime,
                                target: None,
                            },
                        );
                    }
                }
                continue;
            }

            match listed.get(leaf) {
                Some(NewINode::Directory { .. }) => {
                    tracing::warn!(
                        "Ignoring object {}: a directory has the same name",
                        info.key
                    );
                }
                Some(NewINode::Symlink { .. }) => {
                    tracing::warn!(
                        "Object {} hides a link of the same name",
                        info.key
                    );
                    listed.insert(leaf.to_string(), file_entry(&info, mtime));
                }
                _ => {
                    listed.insert(leaf.to_string(), file_entry(&info, mtime));
                }
            }
        }

        listed
    }

    /// Drop a directory's listing so the next access re-reads the backend.
    pub fn invalidate(&self, dir: &Arc<dyn INode>) {
        if let Some(dir_node) = dir.as_dir() {
            dir_node.invalidate();
        }
    }

    /// Invalidate the cached directory at a path, if it is cached.
    pub fn invalidate_path(&self, path: &str) {
        if let Some(node) = self.inodes.get_by_path(path) {
            self.invalidate(&node);
        }
    }

    /// Target of a symlink, fetched from the backend on first use.
    pub async fn symlink_target(&self, node: &Arc<dyn INode>) -> Result<String, VfsError> {
        let link_node = node
            .as_symlink()
            .ok_or_else(|| VfsError::InvalidArgument(format!("{} is not a symlink", node.path())))?;
        if let Some(target) = link_node.target() {
            return Ok(target);
        }

        let key: String = node.backend_key();
        let data: Vec<u8> = self.store.get(&key).await?;
        let target: String = link::decode(&key, data)?;
        link_node.set_target(target.clone());
        Ok(target)
    }

    /// Create a directory on the backend and in the tree.
    pub async fn create_dir(
        &self,
        parent: &Arc<dyn INode>,
        name: &str,
    ) -> Result<Arc<dyn INode>, VfsError> {
        let path: String = join(&parent.path(), name);
        self.store
            .create_dir(&backend_key_for(INodeType::Directory, &path))
            .await?;

        let node: Arc<dyn INode> = self.inodes.insert(
            parent.id(),
            name,
            NewINode::Directory {
                mtime: SystemTime::now(),
            },
        )?;
        // Nothing can be below a directory we just made.
        if let Some(dir_node) = node.as_dir() {
            dir_node.mark_listed();
        }
        Ok(node)
    }

    /// Store a symlink object and add the link to the tree.
    pub async fn create_symlink(
        &self,
        parent: &Arc<dyn INode>,
        name: &str,
        target: &str,
    ) -> Result<Arc<dyn INode>, VfsError> {
        if !self.links {
            return Err(VfsError::Unsupported(
                "symlinks are disabled for this mount".to_string(),
            ));
        }

        let path: String = join(&parent.path(), name);
        let key: String = backend_key_for(INodeType::Symlink, &path);
        let now: SystemTime = SystemTime::now();
        let info: ObjectInfo = self.store.put(&key, &link::encode(target), Some(now)).await?;

        self.inodes.insert(
            parent.id(),
            name,
            NewINode::Symlink {
                object_size: info.size,
                mtime: info.mod_time.unwrap_or(now),
                target: Some(target.to_string()),
            },
        )
    }

    /// Add a file that exists only locally until its first upload.
    pub fn insert_local_file(
        &self,
        parent: &Arc<dyn INode>,
        name: &str,
    ) -> Result<Arc<dyn INode>, VfsError> {
        self.inodes.insert(
            parent.id(),
            name,
            NewINode::File {
                size: 0,
                mtime: SystemTime::now(),
                flushed: false,
            },
        )
    }

    /// Upload a file's full content.
    ///
    /// # Arguments
    /// * `node` - File being written
    /// * `data` - Full new content
    /// * `mod_time` - Desired modification time
    ///
    /// # Returns
    /// Object info as recorded by the backend.
    pub async fn upload(
        &self,
        node: &Arc<dyn INode>,
        data: &[u8],
        mod_time: SystemTime,
    ) -> Result<ObjectInfo, VfsError> {
        let key: String = node.backend_key();
        Ok(self.store.put(&key, data, Some(mod_time)).await?)
    }

    /// Persist a modification time on an existing object.
    ///
    /// # Returns
    /// False if the backend cannot store it; the caller keeps it in memory.
    pub async fn persist_mod_time(
        &self,
        node: &Arc<dyn INode>,
        mod_time: SystemTime,
    ) -> Result<bool, VfsError> {
        if !self.capabilities().set_mod_time {
            return Ok(false);
        }
        match self.store.set_mod_time(&node.backend_key(), mod_time).await {
            Ok(()) => Ok(true),
            Err(StorageError::Unsupported { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a file or symlink.
    pub async fn remove_file(&self, node: &Arc<dyn INode>) -> Result<(), VfsError> {
        let local_only: bool = node.as_file().is_some_and(|f| !f.is_flushed());
        if !local_only {
            self.store.delete(&node.backend_key()).await?;
        }
        self.inodes.remove(node.id())
    }

    /// Delete an empty directory.
    pub async fn remove_dir(&self, node: &Arc<dyn INode>) -> Result<(), VfsError> {
        self.ensure_listed(node).await?;
        let child_count: usize = node.as_dir().map(|d| d.child_count()).unwrap_or(0);
        if child_count > 0 {
            return Err(VfsError::NotEmpty(node.path()));
        }

        match self.store.remove_dir(&node.backend_key()).await {
            Ok(()) => {}
            // Implicit directories have no marker to remove.
            Err(e) if e.is_not_found() => {}
            Err(StorageError::DirectoryNotEmpty { .. }) => {
                self.invalidate(node);
                return Err(VfsError::NotEmpty(node.path()));
            }
            Err(e) => return Err(e.into()),
        }
        self.inodes.remove(node.id())
    }

    /// Rename an entry on the backend, then in the tree.
    ///
    /// # Arguments
    /// * `node` - Entry to move
    /// * `new_parent` - Destination directory
    /// * `new_name` - Destination name
    /// * `replaced` - Entry currently at the destination, already checked
    ///   to be replaceable
    pub async fn rename(
        &self,
        node: &Arc<dyn INode>,
        new_parent: &Arc<dyn INode>,
        new_name: &str,
        replaced: Option<&Arc<dyn INode>>,
    ) -> Result<(), VfsError> {
        let new_path: String = join(&new_parent.path(), new_name);
        let new_key: String = backend_key_for(node.inode_type(), &new_path);

        match node.inode_type() {
            INodeType::Directory => {
                let keep_dst_marker: bool = replaced.is_some();
                if let Err(e) = self
                    .move_prefix(&node.backend_key(), &new_key, keep_dst_marker)
                    .await
                {
                    self.invalidate(node);
                    self.invalidate(new_parent);
                    return Err(e);
                }
            }
            _ if node.as_file().is_some_and(|f| !f.is_flushed()) => {}
            _ => {
                self.move_object(&node.backend_key(), &new_key, node.mtime())
                    .await?;
            }
        }

        if let Some(old) = replaced {
            let old_key: String = old.backend_key();
            let old_on_backend: bool = old.as_file().map_or(true, |f| f.is_flushed());
            if old.inode_type() != INodeType::Directory && old_key != new_key && old_on_backend {
                match self.store.delete(&old_key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!("Failed to delete replaced object {}: {}", old_key, e);
                        self.invalidate(new_parent);
                    }
                }
            }
            self.inodes.remove(old.id())?;
        }

        self.inodes.relocate(node.id(), new_parent.id(), new_name)
    }

    /// Move one object, falling back to copy-then-delete.
    ///
    /// On fallback failure at most one of source and destination is left:
    /// a failed copy leaves the source, and a failed source delete removes
    /// the copy again.
    async fn move_object(&self, src: &str, dst: &str, mod_time: SystemTime) -> Result<(), VfsError> {
        match self.store.move_object(src, dst).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_unsupported() => {}
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("Copying {} to {} (no server-side move)", src, dst);
        let data: Vec<u8> = self.store.get(src).await?;
        self.store.put(dst, &data, Some(mod_time)).await?;

        if let Err(e) = self.store.delete(src).await {
            tracing::warn!("Failed to delete {} after copy, removing {}: {}", src, dst, e);
            if let Err(rollback) = self.store.delete(dst).await {
                tracing::warn!("Failed to remove copy {}: {}", dst, rollback);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Move every object and marker below one prefix to another.
    ///
    /// Objects already moved are moved back if a later one fails.
    async fn move_prefix(
        &self,
        src: &str,
        dst: &str,
        keep_dst_marker: bool,
    ) -> Result<(), VfsError> {
        let walk: PrefixWalk = self.walk_prefix(src).await?;
        let rebase = |key: &str| -> String { format!("{}{}", dst, &key[src.len()..]) };

        let mut created: Vec<String> = Vec::new();
        let markers: Vec<String> = std::iter::once(dst.to_string())
            .chain(walk.dirs.iter().map(|d| rebase(d.as_str())))
            .collect();
        for marker in markers {
            if let Err(e) = self.store.create_dir(&marker).await {
                self.remove_markers(&created, dst, keep_dst_marker).await;
                return Err(e.into());
            }
            created.push(marker);
        }

        let mut moved: Vec<(String, String, SystemTime)> = Vec::new();
        for object in &walk.objects {
            let target: String = rebase(object.key.as_str());
            let mod_time: SystemTime = object.mod_time.unwrap_or(self.mount_time);
            if let Err(e) = self.move_object(&object.key, &target, mod_time).await {
                for (from, to, t) in moved.iter().rev() {
                    if let Err(undo) = self.move_object(to, from, *t).await {
                        tracing::warn!("Failed to move {} back to {}: {}", to, from, undo);
                    }
                }
                self.remove_markers(&created, dst, keep_dst_marker).await;
                return Err(e);
            }
            moved.push((object.key.clone(), target, mod_time));
        }

        let src_marker: String = src.to_string();
        for marker in walk.dirs.iter().rev().chain(std::iter::once(&src_marker)) {
            match self.store.remove_dir(marker).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!("Failed to remove marker {}: {}", marker, e),
            }
        }
        Ok(())
    }

    async fn remove_markers(&self, created: &[String], dst: &str, keep_dst_marker: bool) {
        for marker in created.iter().rev() {
            if keep_dst_marker && marker == dst {
                continue;
            }
            if let Err(e) = self.store.remove_dir(marker).await {
                tracing::warn!("Failed to remove marker {}: {}", marker, e);
            }
        }
    }

    /// Collect every object and sub-prefix below a prefix.
    async fn walk_prefix(&self, prefix: &str) -> Result<PrefixWalk, VfsError> {
        let mut walk: PrefixWalk = PrefixWalk {
            objects: Vec::new(),
            dirs: Vec::new(),
        };
        let mut pending: Vec<String> = vec![prefix.to_string()];

        while let Some(current) = pending.pop() {
            for info in self.store.list(&current).await? {
                if info.is_prefix {
                    walk.dirs.push(info.key.clone());
                    pending.push(info.key);
                } else {
                    walk.objects.push(info);
                }
            }
        }
        Ok(walk)
    }
}

fn file_entry(info: &ObjectInfo, mtime: SystemTime) -> NewINode {
    NewINode::File {
        size: info.size,
        mtime,
        flushed: true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use objmount_storage::{MemoryObjectStore, StoreCapabilities, StoreOp};

    use super::*;

    fn setup(options: VfsOptions) -> (Arc<MemoryObjectStore>, DirectoryTree) {
        let store: Arc<MemoryObjectStore> = Arc::new(MemoryObjectStore::new());
        let tree: DirectoryTree = DirectoryTree::new(store.clone(), &options);
        (store, tree)
    }

    #[tokio::test]
    async fn test_listing_is_lazy_and_cached() {
        let (store, tree) = setup(VfsOptions::default());
        store.insert_object("a/f", b"x".to_vec(), UNIX_EPOCH);
        assert_eq!(store.call_count(StoreOp::List), 0);

        let f: Arc<dyn INode> = tree.lookup("a/f").await.unwrap();
        assert_eq!(f.size(), 1);
        assert_eq!(store.call_count(StoreOp::List), 2);

        tree.lookup("a/f").await.unwrap();
        assert_eq!(store.call_count(StoreOp::List), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_relists_every_time() {
        let (store, tree) = setup(VfsOptions::default().with_dir_cache_time(Duration::ZERO));
        store.insert_object("f", b"x".to_vec(), UNIX_EPOCH);

        let root: Arc<dyn INode> = tree.inodes().root();
        tree.list(&root).await.unwrap();
        tree.list(&root).await.unwrap();
        assert_eq!(store.call_count(StoreOp::List), 2);
    }

    #[tokio::test]
    async fn test_links_translated_and_regular_object_wins() {
        let (store, tree) = setup(VfsOptions::default());
        store.insert_object("l.rclonelink", b"target".to_vec(), UNIX_EPOCH);
        store.insert_object("dup", b"real".to_vec(), UNIX_EPOCH);
        store.insert_object("dup.rclonelink", b"other".to_vec(), UNIX_EPOCH);

        let root: Arc<dyn INode> = tree.inodes().root();
        let names: Vec<(String, INodeType)> = tree
            .list(&root)
            .await
            .unwrap()
            .iter()
            .map(|n| (n.name(), n.inode_type()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("dup".to_string(), INodeType::File),
                ("l".to_string(), INodeType::Symlink),
            ]
        );

        let link_node: Arc<dyn INode> = tree.lookup("l").await.unwrap();
        assert_eq!(tree.symlink_target(&link_node).await.unwrap(), "target");
        assert_eq!(store.call_count(StoreOp::Get), 1);
        tree.symlink_target(&link_node).await.unwrap();
        assert_eq!(store.call_count(StoreOp::Get), 1);
    }

    #[tokio::test]
    async fn test_links_disabled_shows_raw_names() {
        let (store, tree) = setup(VfsOptions::default().with_links(false));
        store.insert_object("l.rclonelink", b"target".to_vec(), UNIX_EPOCH);

        let node: Arc<dyn INode> = tree.lookup("l.rclonelink").await.unwrap();
        assert_eq!(node.inode_type(), INodeType::File);
        assert!(tree.lookup("l").await.is_err());

        let root: Arc<dyn INode> = tree.inodes().root();
        let result = tree.create_symlink(&root, "x", "y").await;
        assert!(matches!(result, Err(VfsError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_refresh_keeps_inode_ids() {
        let (store, tree) = setup(VfsOptions::default());
        store.insert_object("f", b"one".to_vec(), UNIX_EPOCH);

        let first: Arc<dyn INode> = tree.lookup("f").await.unwrap();
        store.insert_object("f", b"three".to_vec(), UNIX_EPOCH);
        tree.refresh(&tree.inodes().root()).await.unwrap();

        let second: Arc<dyn INode> = tree.lookup("f").await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(second.size(), 5);
    }

    #[tokio::test]
    async fn test_vanished_directory_is_dropped() {
        let (store, tree) = setup(VfsOptions::default());
        store.insert_object("d/f", b"x".to_vec(), UNIX_EPOCH);

        let dir: Arc<dyn INode> = tree.lookup("d").await.unwrap();
        store.remove_object("d/f");

        let result = tree.refresh(&dir).await;
        assert!(matches!(result, Err(VfsError::NotFound(_))));
        assert!(tree.inodes().get_by_path("d").is_none());
    }

    #[tokio::test]
    async fn test_copy_fallback_rolls_back_on_delete_failure() {
        let store: Arc<MemoryObjectStore> =
            Arc::new(MemoryObjectStore::with_capabilities(StoreCapabilities {
                server_side_move: false,
                ..StoreCapabilities::default()
            }));
        let tree: DirectoryTree = DirectoryTree::new(store.clone(), &VfsOptions::default());
        store.insert_object("src", b"data".to_vec(), UNIX_EPOCH);

        let root: Arc<dyn INode> = tree.inodes().root();
        let src: Arc<dyn INode> = tree.lookup("src").await.unwrap();
        store.fail_next(StoreOp::Delete, "src");

        let result = tree.rename(&src, &root, "dst", None).await;
        assert!(result.is_err());
        assert_eq!(store.object("src").as_deref(), Some(&b"data"[..]));
        assert!(store.object("dst").is_none());
        assert_eq!(src.path(), "src");
    }
}
