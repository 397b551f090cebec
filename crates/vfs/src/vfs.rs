//! Filesystem operations over the directory tree.
//!
//! [`Vfs`] is what a kernel binding (FUSE, NFS, ...) calls into. It resolves
//! paths, follows symlinks, stages writes, serializes mutations per path and
//! turns backend `NotFound` errors on cached entries into one re-list and
//! retry before giving up.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use objmount_storage::{ObjectInfo, ObjectStore, StorageError};

use crate::handle::{FileHandle, HandleState, HandleTable, OpenHandle, OpenOptions, WriteState};
use crate::inode::{INode, INodeId, INodeType, SYMLINK_PERMS};
use crate::link;
use crate::locks::{PathGuard, PathLocks};
use crate::options::VfsOptions;
use crate::path::{
    is_same_or_descendant, is_valid_name, join, normalize, resolve_link_target, split_path,
};
use crate::tree::DirectoryTree;
use crate::write::{
    MaterializedCache, MemoryWriteCache, ModTimeReconciler, TimeSetOutcome, WriteCache,
    WriteCompletion,
};
use crate::VfsError;

/// Attributes reported for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttr {
    /// Inode number.
    pub ino: INodeId,
    /// Entry type.
    pub kind: INodeType,
    /// Size in bytes; a symlink reports its target length.
    pub size: u64,
    /// Modification time, including any time pending for an open writer.
    pub mtime: SystemTime,
    /// Permission bits.
    pub perm: u16,
}

impl FileAttr {
    /// Check whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == INodeType::Directory
    }

    /// Check whether this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == INodeType::File
    }

    /// Check whether this is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.kind == INodeType::Symlink
    }
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Logical name.
    pub name: String,
    /// Entry attributes.
    pub attr: FileAttr,
}

/// Snapshot of VFS activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfsStats {
    /// Cached inodes, root included.
    pub inodes: usize,
    /// Open handles.
    pub open_handles: usize,
    /// Open handles with write access.
    pub open_writers: usize,
    /// Paths with at least one open writer.
    pub pending_writes: usize,
    /// Paths currently locked or awaited.
    pub locked_paths: usize,
}

/// Virtual filesystem over an object store.
pub struct Vfs {
    tree: DirectoryTree,
    handles: HandleTable,
    reconciler: ModTimeReconciler,
    locks: PathLocks,
    cache: Arc<dyn WriteCache>,
    options: VfsOptions,
}

impl Vfs {
    /// Create a VFS, staging writes on disk if `cache_dir` is set.
    ///
    /// # Arguments
    /// * `store` - Backend object store
    /// * `options` - Mount options
    pub fn new(store: Arc<dyn ObjectStore>, options: VfsOptions) -> Result<Self, VfsError> {
        let cache: Arc<dyn WriteCache> = match &options.cache_dir {
            Some(dir) => Arc::new(
                MaterializedCache::new(dir.clone()).map_err(crate::write::WriteCacheError::from)?,
            ),
            None => Arc::new(MemoryWriteCache::new()),
        };
        Ok(Self::with_write_cache(store, options, cache))
    }

    /// Create a VFS with a caller-supplied write cache.
    pub fn with_write_cache(
        store: Arc<dyn ObjectStore>,
        options: VfsOptions,
        cache: Arc<dyn WriteCache>,
    ) -> Self {
        tracing::debug!("Creating VFS with options {:?}", options);
        Self {
            tree: DirectoryTree::new(store, &options),
            handles: HandleTable::new(),
            reconciler: ModTimeReconciler::new(),
            locks: PathLocks::new(),
            cache,
            options,
        }
    }

    /// Mount options.
    pub fn options(&self) -> &VfsOptions {
        &self.options
    }

    /// Cached directory tree.
    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    /// Pending modification times.
    pub fn reconciler(&self) -> &ModTimeReconciler {
        &self.reconciler
    }

    // ========================================================================
    // Path resolution
    // ========================================================================

    /// Resolve a path, following symlinks in every non-final component and,
    /// if `follow_last`, in the final one too.
    async fn resolve(&self, path: &str, follow_last: bool) -> Result<Arc<dyn INode>, VfsError> {
        let normalized: String = normalize(path);
        tracing::trace!("Resolving {:?} (follow_last={})", normalized, follow_last);

        let root: Arc<dyn INode> = self.tree.inodes().root();
        let mut pending: VecDeque<String> = components(&normalized);
        let mut current: Arc<dyn INode> = root.clone();
        let mut hops: u32 = 0;

        while let Some(component) = pending.pop_front() {
            if current.inode_type() != INodeType::Directory {
                return Err(VfsError::NotDirectory(current.path()));
            }
            let child: Arc<dyn INode> = self
                .tree
                .child(&current, &component)
                .await?
                .ok_or_else(|| VfsError::NotFound(join(&current.path(), &component)))?;

            let follow: bool =
                child.inode_type() == INodeType::Symlink && (follow_last || !pending.is_empty());
            if !follow {
                current = child;
                continue;
            }

            hops += 1;
            if hops > self.options.max_symlink_hops {
                return Err(VfsError::TooManyLinks(normalized));
            }
            let target: String = self.tree.symlink_target(&child).await?;
            let mut restart: VecDeque<String> =
                components(&resolve_link_target(&child.path(), &target));
            restart.extend(pending.drain(..));
            pending = restart;
            current = root.clone();
        }

        Ok(current)
    }

    /// Resolve the directory that holds a path's final component.
    async fn resolve_parent(&self, path: &str) -> Result<(Arc<dyn INode>, String), VfsError> {
        let normalized: String = normalize(path);
        if normalized.is_empty() {
            return Err(VfsError::InvalidArgument(
                "operation not valid on the root".to_string(),
            ));
        }

        let (parent_path, name) = split_path(&normalized);
        if !is_valid_name(name) {
            return Err(VfsError::InvalidArgument(format!("bad name {:?}", name)));
        }
        let parent: Arc<dyn INode> = self.resolve(parent_path, true).await?;
        if parent.inode_type() != INodeType::Directory {
            return Err(VfsError::NotDirectory(parent.path()));
        }
        Ok((parent, name.to_string()))
    }

    /// Follow symlinks at the final component, dangling ones included.
    ///
    /// # Returns
    /// Parent directory, final name and the entry there, if any.
    async fn resolve_for_open(
        &self,
        path: &str,
    ) -> Result<(Arc<dyn INode>, String, Option<Arc<dyn INode>>), VfsError> {
        let mut target_path: String = normalize(path);
        let mut hops: u32 = 0;

        loop {
            if target_path.is_empty() {
                return Err(VfsError::IsDirectory(String::new()));
            }
            let (parent, name) = self.resolve_parent(&target_path).await?;
            let existing: Option<Arc<dyn INode>> = self.tree.child(&parent, &name).await?;

            match existing {
                Some(node) if node.inode_type() == INodeType::Symlink => {
                    hops += 1;
                    if hops > self.options.max_symlink_hops {
                        return Err(VfsError::TooManyLinks(normalize(path)));
                    }
                    let target: String = self.tree.symlink_target(&node).await?;
                    target_path = resolve_link_target(&node.path(), &target);
                }
                other => return Ok((parent, name, other)),
            }
        }
    }

    /// Run an operation, re-listing and retrying once if it hit an entry
    /// the backend no longer has.
    async fn retry_stale<T, F, Fut>(&self, path: &str, mut op: F) -> Result<T, VfsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VfsError>>,
    {
        match op().await {
            Err(e) if is_stale(&e) => {
                tracing::warn!("Stale entry at {:?} ({}), re-listing", path, e);
                self.invalidate_around(path);
                match op().await {
                    Err(VfsError::Backend(StorageError::NotFound { .. })) => {
                        Err(VfsError::NotFound(normalize(path)))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    fn invalidate_around(&self, path: &str) {
        let normalized: String = normalize(path);
        let (parent, _) = split_path(&normalized);
        self.tree.invalidate_path(parent);
        self.tree.invalidate_path(&normalized);
    }

    /// Lock the current path of a node, re-locking if it moved meanwhile.
    async fn lock_node_path(&self, node: &Arc<dyn INode>) -> PathGuard {
        loop {
            let path: String = node.path();
            let guard: PathGuard = self.locks.lock(&path).await;
            if node.path() == path {
                return guard;
            }
        }
    }

    /// Lock the current path of `name` under `parent`, re-locking if the
    /// parent moved meanwhile.
    async fn lock_child(&self, parent: &Arc<dyn INode>, name: &str) -> (String, PathGuard) {
        loop {
            let full: String = join(&parent.path(), name);
            let guard: PathGuard = self.locks.lock(&full).await;
            if join(&parent.path(), name) == full {
                return (full, guard);
            }
        }
    }

    /// Reject names that listings would read back as symlinks.
    fn check_regular_name(&self, full: &str, name: &str) -> Result<(), VfsError> {
        if self.tree.links_enabled() && link::is_symlink_object_name(name) {
            return Err(VfsError::InvalidArgument(format!(
                "{} ends with the reserved suffix {}",
                full,
                link::LINK_SUFFIX
            )));
        }
        Ok(())
    }

    fn attr(&self, node: &Arc<dyn INode>) -> FileAttr {
        let kind: INodeType = node.inode_type();
        let mut mtime: SystemTime = node.mtime();
        if kind == INodeType::File {
            if let Some(intended) = self.reconciler.intended_mod_time(&node.path()) {
                mtime = intended;
            }
        }
        let perm: u16 = match kind {
            INodeType::Directory => self.options.dir_perms,
            INodeType::File => self.options.file_perms,
            INodeType::Symlink => SYMLINK_PERMS,
        };
        FileAttr {
            ino: node.id(),
            kind,
            size: node.size(),
            mtime,
            perm,
        }
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Attributes of an entry, not following a final symlink.
    pub async fn stat(&self, path: &str) -> Result<FileAttr, VfsError> {
        self.retry_stale(path, || self.stat_once(path, false)).await
    }

    /// Attributes of an entry, following a final symlink.
    pub async fn stat_follow(&self, path: &str) -> Result<FileAttr, VfsError> {
        self.retry_stale(path, || self.stat_once(path, true)).await
    }

    async fn stat_once(&self, path: &str, follow: bool) -> Result<FileAttr, VfsError> {
        let node: Arc<dyn INode> = self.resolve(path, follow).await?;
        if node.inode_type() == INodeType::Symlink {
            // Size is the target length, which needs the target.
            self.tree.symlink_target(&node).await?;
        }
        Ok(self.attr(&node))
    }

    /// Entries of a directory, sorted by name.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, VfsError> {
        self.retry_stale(path, || self.readdir_once(path)).await
    }

    async fn readdir_once(&self, path: &str) -> Result<Vec<DirEntry>, VfsError> {
        let dir: Arc<dyn INode> = self.resolve(path, true).await?;
        if dir.inode_type() != INodeType::Directory {
            return Err(VfsError::NotDirectory(dir.path()));
        }
        let children: Vec<Arc<dyn INode>> = self.tree.list(&dir).await?;

        // A link's size is its target length, which needs the target.
        futures::future::try_join_all(
            children
                .iter()
                .filter(|child| child.inode_type() == INodeType::Symlink)
                .map(|child| self.tree.symlink_target(child)),
        )
        .await?;

        Ok(children
            .iter()
            .map(|child| DirEntry {
                name: child.name(),
                attr: self.attr(child),
            })
            .collect())
    }

    /// Target of a symlink.
    pub async fn readlink(&self, path: &str) -> Result<String, VfsError> {
        self.retry_stale(path, || self.readlink_once(path)).await
    }

    async fn readlink_once(&self, path: &str) -> Result<String, VfsError> {
        let node: Arc<dyn INode> = self.resolve(path, false).await?;
        if node.inode_type() != INodeType::Symlink {
            return Err(VfsError::InvalidArgument(format!(
                "{} is not a symlink",
                node.path()
            )));
        }
        self.tree.symlink_target(&node).await
    }

    /// Set a file's modification time.
    ///
    /// While the file is open for writing the time is held until the upload
    /// on release, so the upload cannot overwrite it.
    ///
    /// # Arguments
    /// * `path` - Entry to update (a final symlink is followed)
    /// * `_atime` - Access time; object stores do not keep one
    /// * `mtime` - New modification time
    pub async fn chtimes(
        &self,
        path: &str,
        _atime: SystemTime,
        mtime: SystemTime,
    ) -> Result<(), VfsError> {
        self.retry_stale(path, || self.chtimes_once(path, mtime))
            .await
    }

    async fn chtimes_once(&self, path: &str, mtime: SystemTime) -> Result<(), VfsError> {
        let node: Arc<dyn INode> = self.resolve(path, true).await?;
        let _guard: PathGuard = self.lock_node_path(&node).await;
        let node_path: String = node.path();

        if let Some(dir) = node.as_dir() {
            dir.set_mtime(mtime);
            return Ok(());
        }
        if let Some(link) = node.as_symlink() {
            link.set_mtime(mtime);
            return Ok(());
        }
        let file = node
            .as_file()
            .ok_or_else(|| VfsError::InvalidArgument(node_path.clone()))?;

        match self.reconciler.on_explicit_time_set(&node_path, mtime) {
            TimeSetOutcome::Deferred => Ok(()),
            TimeSetOutcome::Immediate => {
                if file.is_flushed() && !self.tree.persist_mod_time(&node, mtime).await? {
                    tracing::debug!("Backend cannot store mod time for {}", node_path);
                }
                file.set_mtime(mtime);
                tracing::debug!("Set mod time of {} to {:?}", node_path, mtime);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Namespace changes
    // ========================================================================

    /// Create a directory.
    pub async fn mkdir(&self, path: &str) -> Result<FileAttr, VfsError> {
        let (parent, name) = self.resolve_parent(path).await?;
        let (full, _guard) = self.lock_child(&parent, &name).await;

        if self.tree.child(&parent, &name).await?.is_some() {
            return Err(VfsError::AlreadyExists(full));
        }
        self.check_regular_name(&full, &name)?;
        let node: Arc<dyn INode> = self.tree.create_dir(&parent, &name).await?;
        tracing::debug!("Created directory {}", full);
        Ok(self.attr(&node))
    }

    /// Remove an empty directory, or a symlink naming one.
    pub async fn rmdir(&self, path: &str) -> Result<(), VfsError> {
        self.retry_stale(path, || self.rmdir_once(path)).await
    }

    async fn rmdir_once(&self, path: &str) -> Result<(), VfsError> {
        let (parent, name) = self.resolve_parent(path).await?;
        let (full, _guard) = self.lock_child(&parent, &name).await;

        let node: Arc<dyn INode> = self
            .tree
            .child(&parent, &name)
            .await?
            .ok_or_else(|| VfsError::NotFound(full.clone()))?;
        match node.inode_type() {
            INodeType::Directory => self.tree.remove_dir(&node).await?,
            // Only the link goes; its target is untouched.
            INodeType::Symlink => self.tree.remove_file(&node).await?,
            INodeType::File => return Err(VfsError::NotDirectory(full)),
        }
        tracing::debug!("Removed {}", full);
        Ok(())
    }

    /// Remove a file or symlink.
    pub async fn unlink(&self, path: &str) -> Result<(), VfsError> {
        self.retry_stale(path, || self.unlink_once(path)).await
    }

    async fn unlink_once(&self, path: &str) -> Result<(), VfsError> {
        let (parent, name) = self.resolve_parent(path).await?;
        let (full, _guard) = self.lock_child(&parent, &name).await;

        let node: Arc<dyn INode> = self
            .tree
            .child(&parent, &name)
            .await?
            .ok_or_else(|| VfsError::NotFound(full.clone()))?;
        if node.inode_type() == INodeType::Directory {
            return Err(VfsError::IsDirectory(full));
        }
        self.tree.remove_file(&node).await?;
        tracing::debug!("Unlinked {}", full);
        Ok(())
    }

    /// Create a symlink.
    ///
    /// # Arguments
    /// * `target` - Target path stored in the link, not checked for existence
    /// * `path` - Where the link is created
    pub async fn symlink(&self, target: &str, path: &str) -> Result<FileAttr, VfsError> {
        if target.is_empty() {
            return Err(VfsError::InvalidArgument("empty symlink target".to_string()));
        }
        let (parent, name) = self.resolve_parent(path).await?;
        let (full, _guard) = self.lock_child(&parent, &name).await;

        if self.tree.child(&parent, &name).await?.is_some() {
            return Err(VfsError::AlreadyExists(full));
        }
        let node: Arc<dyn INode> = self.tree.create_symlink(&parent, &name, target).await?;
        tracing::debug!("Created symlink {} -> {}", full, target);
        Ok(self.attr(&node))
    }

    /// Rename a file, directory or symlink.
    ///
    /// An existing destination is replaced when POSIX allows it: a file or
    /// link by anything but a directory, an empty directory by a directory.
    /// A symlink is renamed as itself, never through its target.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), VfsError> {
        self.retry_stale(old_path, || self.rename_once(old_path, new_path))
            .await
    }

    async fn rename_once(&self, old_path: &str, new_path: &str) -> Result<(), VfsError> {
        let (src_parent, src_name) = self.resolve_parent(old_path).await?;
        let (dst_parent, dst_name) = self.resolve_parent(new_path).await?;

        // A directory rename also excludes everything below both paths.
        let (src_path, dst_path, _guard) = loop {
            let src_path: String = join(&src_parent.path(), &src_name);
            let dst_path: String = join(&dst_parent.path(), &dst_name);
            let guard: PathGuard = self
                .locks
                .lock_many(&[src_path.as_str(), dst_path.as_str()])
                .await;
            if join(&src_parent.path(), &src_name) == src_path
                && join(&dst_parent.path(), &dst_name) == dst_path
            {
                break (src_path, dst_path, guard);
            }
        };

        let node: Arc<dyn INode> = self
            .tree
            .child(&src_parent, &src_name)
            .await?
            .ok_or_else(|| VfsError::NotFound(src_path.clone()))?;
        if src_path == dst_path {
            return Ok(());
        }
        if node.inode_type() == INodeType::Directory
            && is_same_or_descendant(&src_path, &dst_parent.path())
        {
            return Err(VfsError::InvalidArgument(format!(
                "cannot move {} into itself",
                src_path
            )));
        }

        if node.inode_type() != INodeType::Symlink {
            self.check_regular_name(&dst_path, &dst_name)?;
        }

        let replaced: Option<Arc<dyn INode>> = self.tree.child(&dst_parent, &dst_name).await?;
        if let Some(existing) = &replaced {
            if existing.id() == node.id() {
                return Ok(());
            }
            match (node.inode_type(), existing.inode_type()) {
                (INodeType::Directory, INodeType::Directory) => {
                    self.tree.ensure_listed(existing).await?;
                    let empty: bool = existing.as_dir().is_some_and(|d| d.child_count() == 0);
                    if !empty {
                        return Err(VfsError::NotEmpty(dst_path));
                    }
                }
                (INodeType::Directory, _) => return Err(VfsError::NotDirectory(dst_path)),
                (_, INodeType::Directory) => return Err(VfsError::IsDirectory(dst_path)),
                _ => {}
            }
        }

        self.tree
            .rename(&node, &dst_parent, &dst_name, replaced.as_ref())
            .await?;
        self.reconciler.rename(&src_path, &dst_path);
        tracing::debug!("Renamed {} -> {}", src_path, dst_path);
        Ok(())
    }

    // ========================================================================
    // File handles
    // ========================================================================

    /// Open a file.
    ///
    /// A final symlink is followed, including one whose target does not
    /// exist yet when `create` is set.
    ///
    /// # Returns
    /// Handle for `read`, `write` and `release`.
    pub async fn open(&self, path: &str, options: OpenOptions) -> Result<FileHandle, VfsError> {
        self.retry_stale(path, || self.open_once(path, options))
            .await
    }

    /// Create (or truncate) a file and open it for writing.
    pub async fn create(&self, path: &str) -> Result<FileHandle, VfsError> {
        self.open(path, OpenOptions::create_truncate()).await
    }

    async fn open_once(&self, path: &str, options: OpenOptions) -> Result<FileHandle, VfsError> {
        let mut options: OpenOptions = options;
        if !options.read && !options.write {
            options.read = true;
        }

        let (parent, name, existing) = self.resolve_for_open(path).await?;
        let (full, _guard): (String, Option<PathGuard>) = if options.write || options.create {
            let (full, guard) = self.lock_child(&parent, &name).await;
            (full, Some(guard))
        } else {
            (join(&parent.path(), &name), None)
        };

        // Re-check under the lock; a concurrent create may have won.
        let existing: Option<Arc<dyn INode>> = if options.create {
            self.tree.child(&parent, &name).await?
        } else {
            existing
        };

        let created: bool = existing.is_none();
        let node: Arc<dyn INode> = match existing {
            Some(node) => match node.inode_type() {
                INodeType::Directory => return Err(VfsError::IsDirectory(full)),
                INodeType::Symlink => return Err(VfsError::Stale(full)),
                INodeType::File if options.create && options.exclusive => {
                    return Err(VfsError::AlreadyExists(full));
                }
                INodeType::File => node,
            },
            None if options.create => {
                self.check_regular_name(&full, &name)?;
                self.tree.insert_local_file(&parent, &name)?
            }
            None => return Err(VfsError::NotFound(full)),
        };

        let writable: bool = options.write || created;
        let mut state: HandleState = HandleState::new(node.size(), node.mtime(), writable);
        if writable {
            let file = node
                .as_file()
                .ok_or_else(|| VfsError::IsDirectory(full.clone()))?;
            file.add_writer();
            self.reconciler.on_open_for_write(&full);

            if created || (options.write && options.truncate) {
                state.start_empty = true;
                state.dirty = true;
                file.set_size(0);
            }
        }

        let handle: Arc<OpenHandle> = self.handles.insert(node, options, state);
        tracing::debug!(
            "Opened {} as handle {} ({:?}, created={})",
            full,
            handle.fh,
            options,
            created
        );
        Ok(handle.fh)
    }

    fn handle(&self, fh: FileHandle) -> Result<Arc<OpenHandle>, VfsError> {
        self.handles.get(fh).ok_or(VfsError::BadHandle(fh))
    }

    /// Fill a writer's staging entry on first use.
    async fn ensure_loaded(
        &self,
        handle: &OpenHandle,
        state: &mut HandleState,
    ) -> Result<(), VfsError> {
        if state.loaded {
            return Ok(());
        }
        let data: Vec<u8> = if state.start_empty {
            Vec::new()
        } else {
            self.fetch_content(&handle.node).await?
        };
        self.cache.load(&state.staging_key, &data).await?;
        state.loaded = true;
        Ok(())
    }

    async fn fetch_content(&self, node: &Arc<dyn INode>) -> Result<Vec<u8>, VfsError> {
        if node.as_file().is_some_and(|f| !f.is_flushed()) {
            return Ok(Vec::new());
        }
        match self.tree.store().get(&node.backend_key()).await {
            Ok(data) => Ok(data),
            // An open handle cannot be re-resolved; report it as stale.
            Err(e) if e.is_not_found() => Err(VfsError::Stale(node.path())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read from an open handle.
    ///
    /// # Returns
    /// Up to `size` bytes; fewer at the end of the file.
    pub async fn read(
        &self,
        fh: FileHandle,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, VfsError> {
        let handle: Arc<OpenHandle> = self.handle(fh)?;
        if !handle.options.read {
            return Err(VfsError::AccessMode(fh));
        }
        let mut state = handle.state.lock().await;

        if state.write_state.is_some() {
            self.ensure_loaded(&handle, &mut state).await?;
            return Ok(self.cache.read_at(&state.staging_key, offset, size).await?);
        }

        let cached: Option<Arc<Vec<u8>>> = state.read_data.clone();
        let data: Arc<Vec<u8>> = match cached {
            Some(data) => data,
            None => {
                let data: Arc<Vec<u8>> = Arc::new(self.fetch_content(&handle.node).await?);
                state.read_data = Some(data.clone());
                data
            }
        };
        let start: usize = (offset as usize).min(data.len());
        let end: usize = start.saturating_add(size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    /// Write to an open handle.
    ///
    /// # Returns
    /// Number of bytes written.
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        let handle: Arc<OpenHandle> = self.handle(fh)?;
        if !handle.options.write {
            return Err(VfsError::AccessMode(fh));
        }
        let _guard: PathGuard = self.lock_node_path(&handle.node).await;
        let mut state = handle.state.lock().await;
        if state.write_state != Some(WriteState::OpenForWrite) {
            return Err(VfsError::BadHandle(fh));
        }

        self.ensure_loaded(&handle, &mut state).await?;
        let key: String = state.staging_key.clone();
        let offset: u64 = if handle.options.append {
            self.cache.size(&key).await?
        } else {
            offset
        };
        let written: usize = self.cache.write_at(&key, offset, data).await?;
        state.dirty = true;

        let size: u64 = self.cache.size(&key).await?;
        if let Some(file) = handle.node.as_file() {
            file.set_size(size);
        }
        Ok(written)
    }

    /// Resize the file behind an open handle.
    pub async fn set_len(&self, fh: FileHandle, size: u64) -> Result<(), VfsError> {
        let handle: Arc<OpenHandle> = self.handle(fh)?;
        if !handle.options.write {
            return Err(VfsError::AccessMode(fh));
        }
        let _guard: PathGuard = self.lock_node_path(&handle.node).await;
        let mut state = handle.state.lock().await;
        if state.write_state != Some(WriteState::OpenForWrite) {
            return Err(VfsError::BadHandle(fh));
        }

        self.ensure_loaded(&handle, &mut state).await?;
        self.cache.truncate(&state.staging_key, size).await?;
        state.dirty = true;
        if let Some(file) = handle.node.as_file() {
            file.set_size(size);
        }
        Ok(())
    }

    /// Resize a file by path.
    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), VfsError> {
        let fh: FileHandle = self.open(path, OpenOptions::write_only()).await?;
        let resized: Result<(), VfsError> = self.set_len(fh, size).await;
        let released: Result<(), VfsError> = self.release(fh).await;
        resized.and(released)
    }

    /// Close a handle, uploading its content if it changed anything.
    ///
    /// The upload is confirmed before this returns. On failure the file
    /// reverts to its state before the handle was opened.
    pub async fn release(&self, fh: FileHandle) -> Result<(), VfsError> {
        let handle: Arc<OpenHandle> = self.handles.remove(fh).ok_or(VfsError::BadHandle(fh))?;
        let _guard: PathGuard = self.lock_node_path(&handle.node).await;
        let mut state = handle.state.lock().await;

        let result: Result<(), VfsError> = if state.write_state.is_some() {
            self.finish_write(&handle, &mut state).await
        } else {
            Ok(())
        };

        if state.write_state.is_some() {
            state.write_state = Some(WriteState::Closed);
            if let Err(e) = self.cache.remove(&state.staging_key).await {
                tracing::warn!("Failed to drop staging for handle {}: {}", fh, e);
            }
        }
        result
    }

    async fn finish_write(
        &self,
        handle: &OpenHandle,
        state: &mut HandleState,
    ) -> Result<(), VfsError> {
        let node: &Arc<dyn INode> = &handle.node;
        let path: String = node.path();
        let file = node
            .as_file()
            .ok_or_else(|| VfsError::IsDirectory(path.clone()))?;
        let live: bool = self.tree.inodes().get(node.id()).is_some();

        if !state.dirty || !live {
            // Nothing to upload; a pending time must not outlive this open.
            self.reconciler.on_write_aborted(&path);
            file.remove_writer();
            return Ok(());
        }

        state.write_state = Some(WriteState::Uploading);
        match self.upload_staged(handle, state, &path).await {
            Ok((info, size)) => {
                let completion: WriteCompletion = self.reconciler.on_write_complete(&path);
                let mtime: SystemTime = if completion.intended {
                    self.apply_intended_time(node, &info, completion.mod_time)
                        .await;
                    completion.mod_time
                } else {
                    info.mod_time.unwrap_or(completion.mod_time)
                };
                file.mark_flushed(size, mtime);
                file.remove_writer();
                tracing::debug!("Uploaded {} ({} bytes)", path, size);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Upload of {} failed: {}", path, e);
                self.reconciler.on_write_aborted(&path);
                file.remove_writer();
                if file.is_flushed() {
                    let (size, mtime) = state.original;
                    file.set_size(size);
                    file.set_mtime(mtime);
                } else if !file.has_writers() {
                    if let Err(remove) = self.tree.inodes().remove(node.id()) {
                        tracing::warn!("Failed to drop unflushed {}: {}", path, remove);
                    }
                }
                Err(e)
            }
        }
    }

    async fn upload_staged(
        &self,
        handle: &OpenHandle,
        state: &mut HandleState,
        path: &str,
    ) -> Result<(ObjectInfo, u64), VfsError> {
        self.ensure_loaded(handle, state).await?;
        let data: Vec<u8> = self.cache.read_all(&state.staging_key).await?;
        let mod_time: SystemTime = self
            .reconciler
            .intended_mod_time(path)
            .unwrap_or_else(SystemTime::now);
        let info: ObjectInfo = self.tree.upload(&handle.node, &data, mod_time).await?;
        Ok((info, data.len() as u64))
    }

    /// Make an intended time stick on backends that ignored it at upload.
    async fn apply_intended_time(&self, node: &Arc<dyn INode>, info: &ObjectInfo, time: SystemTime) {
        if info.mod_time == Some(time) {
            return;
        }
        match self.tree.persist_mod_time(node, time).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Backend cannot store mod time for {}", node.path());
            }
            Err(e) => {
                tracing::warn!("Failed to set mod time on {}: {}", node.path(), e);
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Cancel every open handle without uploading anything.
    ///
    /// # Returns
    /// Number of handles that were open.
    pub async fn shutdown(&self) -> usize {
        let handles: Vec<Arc<OpenHandle>> = self.handles.drain();
        let count: usize = handles.len();
        futures::future::join_all(handles.iter().map(|h| self.abandon(h))).await;
        self.reconciler.clear();
        tracing::debug!("Shut down VFS, cancelled {} handles", count);
        count
    }

    async fn abandon(&self, handle: &Arc<OpenHandle>) {
        let mut state = handle.state.lock().await;
        if state.write_state.is_none() {
            return;
        }

        if let Some(file) = handle.node.as_file() {
            file.remove_writer();
            let live: bool = self.tree.inodes().get(handle.node.id()).is_some();
            if live && !file.is_flushed() && !file.has_writers() {
                if let Err(e) = self.tree.inodes().remove(handle.node.id()) {
                    tracing::warn!("Failed to drop unflushed {}: {}", handle.node.path(), e);
                }
            }
        }
        if let Err(e) = self.cache.remove(&state.staging_key).await {
            tracing::warn!("Failed to drop staging for handle {}: {}", handle.fh, e);
        }
        state.write_state = Some(WriteState::Closed);
    }

    /// Current activity counters.
    pub fn stats(&self) -> VfsStats {
        VfsStats {
            inodes: self.tree.inodes().inode_count(),
            open_handles: self.handles.len(),
            open_writers: self.handles.writer_count(),
            pending_writes: self.reconciler.pending_count(),
            locked_paths: self.locks.active(),
        }
    }
}

fn components(path: &str) -> VecDeque<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Errors meaning a cached entry no longer matches the backend.
fn is_stale(error: &VfsError) -> bool {
    matches!(
        error,
        VfsError::Stale(_) | VfsError::Backend(StorageError::NotFound { .. })
    )
}
