//! Open file handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::inode::INode;

/// Handle number returned by `open`.
pub type FileHandle = u64;

/// Access requested when opening a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Allow reads.
    pub read: bool,
    /// Allow writes.
    pub write: bool,
    /// Create the file if missing.
    pub create: bool,
    /// With `create`, fail if the file exists.
    pub exclusive: bool,
    /// Discard existing content.
    pub truncate: bool,
    /// Every write goes to the current end.
    pub append: bool,
}

impl OpenOptions {
    /// Read-only access.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Write-only access to an existing file.
    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// Read-write access to an existing file.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Create or truncate for writing, as `creat(2)` does.
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Set the create flag.
    pub fn with_create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Set the exclusive flag.
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Set the truncate flag.
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Set the append flag.
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Decode POSIX `open(2)` flags.
    pub fn from_flags(flags: i32) -> Self {
        let access: i32 = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            create: flags & libc::O_CREAT != 0,
            exclusive: flags & libc::O_EXCL != 0,
            truncate: flags & libc::O_TRUNC != 0,
            append: flags & libc::O_APPEND != 0,
        }
    }

    /// Check whether the handle needs a staging buffer.
    pub fn is_write(&self) -> bool {
        self.write
    }
}

/// Lifecycle of a handle open for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Accepting writes.
    OpenForWrite,
    /// Content is being uploaded.
    Uploading,
    /// Released.
    Closed,
}

/// Mutable per-handle state, guarded by the handle's own lock.
#[derive(Debug)]
pub struct HandleState {
    /// Staging key in the write cache (writers only).
    pub staging_key: String,
    /// Whether staging holds the file's full current content.
    pub loaded: bool,
    /// Staging starts empty instead of from the backend object.
    pub start_empty: bool,
    /// Whether anything must be uploaded on release.
    pub dirty: bool,
    /// Writer lifecycle; `None` for read-only handles.
    pub write_state: Option<WriteState>,
    /// Size and time before this handle touched the file, for revert.
    pub original: (u64, SystemTime),
    /// Whole content fetched for a read-only handle.
    pub read_data: Option<Arc<Vec<u8>>>,
}

/// An open handle.
#[derive(Debug)]
pub struct OpenHandle {
    /// Handle number.
    pub fh: FileHandle,
    /// File the handle refers to; follows renames.
    pub node: Arc<dyn INode>,
    /// Access requested at open.
    pub options: OpenOptions,
    /// Mutable state.
    pub state: AsyncMutex<HandleState>,
}

/// Table of open handles.
#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    handles: Mutex<HashMap<FileHandle, Arc<OpenHandle>>>,
}

impl HandleTable {
    /// Create an empty table. Handle numbers start at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handle.
    ///
    /// # Arguments
    /// * `node` - Opened file
    /// * `options` - Requested access
    /// * `state` - Initial state; writers get their staging key here
    pub fn insert(
        &self,
        node: Arc<dyn INode>,
        options: OpenOptions,
        mut state: HandleState,
    ) -> Arc<OpenHandle> {
        let fh: FileHandle = self.next.fetch_add(1, Ordering::SeqCst);
        if state.write_state.is_some() {
            state.staging_key = format!("handle-{}", fh);
        }
        let handle: Arc<OpenHandle> = Arc::new(OpenHandle {
            fh,
            node,
            options,
            state: AsyncMutex::new(state),
        });
        self.handles.lock().insert(fh, handle.clone());
        handle
    }

    /// Look up a handle.
    pub fn get(&self, fh: FileHandle) -> Option<Arc<OpenHandle>> {
        self.handles.lock().get(&fh).cloned()
    }

    /// Unregister a handle.
    pub fn remove(&self, fh: FileHandle) -> Option<Arc<OpenHandle>> {
        self.handles.lock().remove(&fh)
    }

    /// Unregister every handle.
    pub fn drain(&self) -> Vec<Arc<OpenHandle>> {
        self.handles.lock().drain().map(|(_, h)| h).collect()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Check whether no handles are open.
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Number of open handles with write access.
    pub fn writer_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| h.options.is_write())
            .count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleState {
    /// Fresh state for a handle on a file of the given size and time.
    pub fn new(size: u64, mtime: SystemTime, writable: bool) -> Self {
        Self {
            staging_key: String::new(),
            loaded: false,
            start_empty: false,
            dirty: false,
            write_state: writable.then_some(WriteState::OpenForWrite),
            original: (size, mtime),
            read_data: None,
        }
    }
}
