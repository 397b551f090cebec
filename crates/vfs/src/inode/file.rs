//! File inode implementation.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;

use super::types::{INode, INodeId, INodeLocation, INodeType};

#[derive(Debug, Clone, Copy)]
struct FileAttrs {
    size: u64,
    mtime: SystemTime,
    /// Whether a backend object exists for this file.
    flushed: bool,
}

/// File inode representing a regular file.
#[derive(Debug)]
pub struct INodeFile {
    /// Inode ID.
    id: INodeId,
    /// Parent, name and path.
    location: RwLock<INodeLocation>,
    /// Size, time and backing state.
    attrs: RwLock<FileAttrs>,
    /// Handles currently open for writing.
    writers: AtomicUsize,
}

impl INodeFile {
    /// Create a new file inode.
    ///
    /// # Arguments
    /// * `id` - Inode ID
    /// * `location` - Parent, name and path
    /// * `size` - File size in bytes
    /// * `mtime` - Modification time
    /// * `flushed` - Whether the file already exists on the backend
    pub fn new(
        id: INodeId,
        location: INodeLocation,
        size: u64,
        mtime: SystemTime,
        flushed: bool,
    ) -> Self {
        Self {
            id,
            location: RwLock::new(location),
            attrs: RwLock::new(FileAttrs {
                size,
                mtime,
                flushed,
            }),
            writers: AtomicUsize::new(0),
        }
    }

    /// Check whether a backend object exists for this file.
    pub fn is_flushed(&self) -> bool {
        self.attrs.read().flushed
    }

    /// Update the in-memory size (writes in progress).
    pub fn set_size(&self, size: u64) {
        self.attrs.write().size = size;
    }

    /// Update the modification time.
    pub fn set_mtime(&self, mtime: SystemTime) {
        self.attrs.write().mtime = mtime;
    }

    /// Record a confirmed upload.
    ///
    /// # Arguments
    /// * `size` - Uploaded size
    /// * `mtime` - Time now in effect for the file
    pub fn mark_flushed(&self, size: u64, mtime: SystemTime) {
        let mut attrs = self.attrs.write();
        attrs.size = size;
        attrs.mtime = mtime;
        attrs.flushed = true;
    }

    /// Register an open writer.
    pub fn add_writer(&self) {
        self.writers.fetch_add(1, Ordering::SeqCst);
    }

    /// Unregister an open writer.
    pub fn remove_writer(&self) {
        let _ = self
            .writers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Check whether any handle has this file open for writing.
    pub fn has_writers(&self) -> bool {
        self.writers.load(Ordering::SeqCst) > 0
    }
}

impl INode for INodeFile {
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
        INodeType::File
    }

    fn size(&self) -> u64 {
        self.attrs.read().size
    }

    fn mtime(&self) -> SystemTime {
        self.attrs.read().mtime
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_inode_file_basic() {
        let mtime: SystemTime = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let file: INodeFile = INodeFile::new(
            2,
            INodeLocation::new(1, "test.txt", "dir/test.txt"),
            1024,
            mtime,
            true,
        );

        assert_eq!(file.id(), 2);
        assert_eq!(file.parent_id(), 1);
        assert_eq!(file.name(), "test.txt");
        assert_eq!(file.path(), "dir/test.txt");
        assert_eq!(file.backend_key(), "dir/test.txt");
        assert_eq!(file.size(), 1024);
        assert_eq!(file.mtime(), mtime);
        assert_eq!(file.inode_type(), INodeType::File);
        assert!(file.is_flushed());
    }

    #[test]
    fn test_mark_flushed() {
        let file: INodeFile =
            INodeFile::new(3, INodeLocation::new(1, "new", "new"), 0, UNIX_EPOCH, false);
        assert!(!file.is_flushed());

        let mtime: SystemTime = UNIX_EPOCH + Duration::from_secs(42);
        file.mark_flushed(6, mtime);
        assert!(file.is_flushed());
        assert_eq!(file.size(), 6);
        assert_eq!(file.mtime(), mtime);
    }

    #[test]
    fn test_writer_count_never_underflows() {
        let file: INodeFile =
            INodeFile::new(3, INodeLocation::new(1, "f", "f"), 0, UNIX_EPOCH, true);
        file.remove_writer();
        assert!(!file.has_writers());

        file.add_writer();
        file.add_writer();
        file.remove_writer();
        assert!(file.has_writers());
        file.remove_writer();
        assert!(!file.has_writers());
    }
}
