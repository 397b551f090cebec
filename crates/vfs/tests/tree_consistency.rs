//! Integration tests for the cached tree against a changing backend.
//!
//! Tests cover:
//! - lazy, TTL-bounded listings
//! - recovery when cached entries no longer exist on the backend
//! - concurrent operations
//! - disk-backed staging
//! - shutdown with open handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use objmount_vfs::{
    DirEntry, FileAttr, FileHandle, INode, INodeType, MemoryObjectStore, ObjectInfo, ObjectStore,
    OpenOptions, StorageError, StoreCapabilities, StoreOp, Vfs, VfsError, VfsOptions, VfsStats,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Helper to create a test environment with the default listing lifetime.
fn create_test_env() -> (Arc<MemoryObjectStore>, Vfs) {
    create_test_env_with(VfsOptions::default())
}

/// Helper to create a test environment with custom options.
fn create_test_env_with(options: VfsOptions) -> (Arc<MemoryObjectStore>, Vfs) {
    let store: Arc<MemoryObjectStore> = Arc::new(MemoryObjectStore::new());
    let vfs: Vfs = Vfs::new(store.clone(), options).unwrap();
    (store, vfs)
}

async fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
    let fh: FileHandle = vfs.create(path).await.unwrap();
    vfs.write(fh, 0, data).await.unwrap();
    vfs.release(fh).await.unwrap();
}

fn names(entries: &[DirEntry]) -> Vec<String> {
    entries.iter().map(|e| e.name.clone()).collect()
}

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

// =============================================================================
// LISTING
// =============================================================================

mod listing {
    use super::*;

    #[tokio::test]
    async fn test_only_visited_directories_are_listed() {
        let (store, vfs) = create_test_env();
        store.insert_object("a/b/c/f", b"deep".to_vec(), at(1));
        store.insert_object("x/y", b"other".to_vec(), at(1));

        assert_eq!(vfs.stat("a/b/c/f").await.unwrap().size, 4);
        assert_eq!(store.call_count(StoreOp::List), 4);

        vfs.stat("a/b/c/f").await.unwrap();
        assert_eq!(names(&vfs.readdir("").await.unwrap()), vec!["a", "x"]);
        assert_eq!(store.call_count(StoreOp::List), 4);
    }

    #[tokio::test]
    async fn test_fresh_listing_hides_outside_changes() {
        let (store, vfs) = create_test_env();
        store.insert_object("first", b"1".to_vec(), at(1));
        assert_eq!(names(&vfs.readdir("").await.unwrap()), vec!["first"]);

        store.insert_object("second", b"2".to_vec(), at(2));
        assert_eq!(names(&vfs.readdir("").await.unwrap()), vec!["first"]);

        vfs.tree().invalidate_path("");
        assert_eq!(
            names(&vfs.readdir("").await.unwrap()),
            vec!["first", "second"]
        );
    }

    #[tokio::test]
    async fn test_zero_lifetime_sees_outside_changes() {
        let (store, vfs) =
            create_test_env_with(VfsOptions::default().with_dir_cache_time(Duration::ZERO));
        store.insert_object("first", b"1".to_vec(), at(1));
        let first_ino: u64 = vfs.stat("first").await.unwrap().ino;

        store.insert_object("second", b"2".to_vec(), at(2));
        store.insert_object("first", b"longer".to_vec(), at(3));

        let entries: Vec<DirEntry> = vfs.readdir("").await.unwrap();
        assert_eq!(names(&entries), vec!["first", "second"]);
        assert_eq!(entries[0].attr.ino, first_ino);
        assert_eq!(entries[0].attr.size, 6);
        assert_eq!(entries[0].attr.mtime, at(3));
    }

    #[tokio::test]
    async fn test_local_files_survive_relisting() {
        let (_store, vfs) =
            create_test_env_with(VfsOptions::default().with_dir_cache_time(Duration::ZERO));

        let fh: FileHandle = vfs.create("draft").await.unwrap();
        vfs.write(fh, 0, b"unsaved").await.unwrap();

        assert_eq!(names(&vfs.readdir("").await.unwrap()), vec!["draft"]);
        assert_eq!(vfs.stat("draft").await.unwrap().size, 7);
        vfs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_directory_beats_object_of_same_name() {
        let (store, vfs) = create_test_env();
        store.insert_object("both", b"file".to_vec(), at(1));
        store.insert_object("both/inner", b"x".to_vec(), at(1));

        let entries: Vec<DirEntry> = vfs.readdir("").await.unwrap();
        assert_eq!(names(&entries), vec!["both"]);
        assert!(entries[0].attr.is_dir());
    }
}

// =============================================================================
// STALE RECOVERY
// =============================================================================

mod stale_recovery {
    use super::*;

    #[tokio::test]
    async fn test_unlink_of_vanished_file_is_not_found() {
        let (store, vfs) = create_test_env();
        store.insert_object("f", b"x".to_vec(), at(1));
        vfs.stat("f").await.unwrap();
        store.remove_object("f");

        let err: VfsError = vfs.unlink("f").await.unwrap_err();
        assert!(matches!(err, VfsError::NotFound(_)));
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(names(&vfs.readdir("").await.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn test_link_replaced_by_file_recovers() {
        let (store, vfs) = create_test_env();
        store.insert_object("l.rclonelink", b"target".to_vec(), at(1));
        store.insert_object("other", b"o".to_vec(), at(1));
        // Lists the root without loading the link target.
        vfs.stat("other").await.unwrap();
        let cached: Arc<dyn INode> = vfs.tree().inodes().get_by_path("l").unwrap();
        assert_eq!(cached.inode_type(), INodeType::Symlink);

        store.remove_object("l.rclonelink");
        store.insert_object("l", b"plain".to_vec(), at(2));

        // The link target read fails, the root is re-listed and the retry
        // finds the file.
        let attr: FileAttr = vfs.stat("l").await.unwrap();
        assert!(attr.is_file());
        assert_eq!(attr.size, 5);
        assert_eq!(store.call_count(StoreOp::List), 2);
    }

    #[tokio::test]
    async fn test_removed_directory_disappears() {
        let (store, vfs) = create_test_env();
        store.insert_object("d/f", b"x".to_vec(), at(1));
        assert_eq!(names(&vfs.readdir("d").await.unwrap()), vec!["f"]);

        store.remove_object("d/f");
        vfs.tree().invalidate_path("d");

        assert!(matches!(vfs.readdir("d").await, Err(VfsError::NotFound(_))));
        assert!(vfs.tree().inodes().get_by_path("d").is_none());
    }

    #[tokio::test]
    async fn test_read_of_vanished_object_is_stale() {
        let (store, vfs) = create_test_env();
        store.insert_object("f", b"x".to_vec(), at(1));

        let fh: FileHandle = vfs.open("f", OpenOptions::read_only()).await.unwrap();
        store.remove_object("f");

        let err: VfsError = vfs.read(fh, 0, 10).await.unwrap_err();
        assert!(matches!(err, VfsError::Stale(_)));
        assert_eq!(err.errno(), libc::ESTALE);
        vfs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_rmdir_of_directory_filled_elsewhere() {
        let (store, vfs) = create_test_env();
        vfs.mkdir("d").await.unwrap();
        store.insert_object("d/late", b"x".to_vec(), at(1));

        // The cached listing says empty; the backend refuses.
        let err: VfsError = vfs.rmdir("d").await.unwrap_err();
        assert!(matches!(err, VfsError::NotEmpty(_)));
        assert_eq!(names(&vfs.readdir("d").await.unwrap()), vec!["late"]);
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Store that can pause one `get` until released.
struct GatedStore {
    inner: Arc<MemoryObjectStore>,
    gated_key: Mutex<Option<String>>,
    reached: Notify,
    resume: Notify,
}

impl GatedStore {
    fn new(inner: Arc<MemoryObjectStore>) -> Self {
        Self {
            inner,
            gated_key: Mutex::new(None),
            reached: Notify::new(),
            resume: Notify::new(),
        }
    }

    /// Pause the next `get` of `key`.
    fn arm(&self, key: &str) {
        *self.gated_key.lock() = Some(key.to_string());
    }
}

#[async_trait]
impl ObjectStore for GatedStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let data: Vec<u8> = self.inner.get(key).await?;
        let gated: bool = {
            let mut gated_key = self.gated_key.lock();
            if gated_key.as_deref() == Some(key) {
                *gated_key = None;
                true
            } else {
                false
            }
        };
        if gated {
            self.reached.notify_one();
            self.resume.notified().await;
        }
        Ok(data)
    }

    async fn put(
        &self,
        key: &str,
        data: &[u8],
        mod_time: Option<SystemTime>,
    ) -> Result<ObjectInfo, StorageError> {
        self.inner.put(key, data, mod_time).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        self.inner.move_object(src, dst).await
    }

    async fn set_mod_time(&self, key: &str, mod_time: SystemTime) -> Result<(), StorageError> {
        self.inner.set_mod_time(key, mod_time).await
    }

    async fn create_dir(&self, prefix: &str) -> Result<(), StorageError> {
        self.inner.create_dir(prefix).await
    }

    async fn remove_dir(&self, prefix: &str) -> Result<(), StorageError> {
        self.inner.remove_dir(prefix).await
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_release_waits_for_directory_rename() {
        let inner: Arc<MemoryObjectStore> =
            Arc::new(MemoryObjectStore::with_capabilities(StoreCapabilities {
                server_side_move: false,
                mod_time_on_put: true,
                set_mod_time: true,
            }));
        inner.insert_object("dir/file", b"OLD".to_vec(), at(1));
        let gated: Arc<GatedStore> = Arc::new(GatedStore::new(inner.clone()));
        let vfs: Vfs = Vfs::new(gated.clone(), VfsOptions::default()).unwrap();

        let fh: FileHandle = vfs.open("dir/file", OpenOptions::read_write()).await.unwrap();
        vfs.write(fh, 0, b"NEW").await.unwrap();
        // The rename's copy of the file stalls after reading the old content.
        gated.arm("dir/file");
        let order: Mutex<Vec<&str>> = Mutex::new(Vec::new());

        let rename = async {
            let result = vfs.rename("dir", "moved").await;
            order.lock().push("renamed");
            result
        };
        let close = async {
            gated.reached.notified().await;
            let release = vfs.release(fh);
            tokio::pin!(release);

            let early = tokio::time::timeout(Duration::from_millis(50), &mut release).await;
            assert!(early.is_err(), "release finished inside a directory rename");

            order.lock().push("resumed");
            gated.resume.notify_one();
            let result = release.await;
            order.lock().push("released");
            result
        };

        let (renamed, released) = tokio::join!(rename, close);
        renamed.unwrap();
        released.unwrap();

        assert_eq!(*order.lock(), vec!["resumed", "renamed", "released"]);
        assert_eq!(inner.keys(), vec!["moved/file".to_string()]);
        assert_eq!(inner.object("moved/file").as_deref(), Some(&b"NEW"[..]));
        assert_eq!(vfs.stat("moved/file").await.unwrap().size, 3);
        assert_eq!(vfs.stats().locked_paths, 0);
    }

    #[tokio::test]
    async fn test_parallel_creates_in_one_directory() {
        let (store, vfs) = create_test_env();
        vfs.mkdir("d").await.unwrap();

        tokio::join!(
            write_file(&vfs, "d/one", b"1"),
            write_file(&vfs, "d/two", b"22"),
            write_file(&vfs, "d/three", b"333"),
        );

        assert_eq!(
            names(&vfs.readdir("d").await.unwrap()),
            vec!["one", "three", "two"]
        );
        assert_eq!(store.keys(), vec!["d/one", "d/three", "d/two"]);
    }

    #[tokio::test]
    async fn test_parallel_writes_to_one_file() {
        let (store, vfs) = create_test_env();
        store.insert_object("f", b"........".to_vec(), at(1));

        let fh: FileHandle = vfs.open("f", OpenOptions::read_write()).await.unwrap();
        let (left, right) = tokio::join!(vfs.write(fh, 0, b"AAAA"), vfs.write(fh, 4, b"BBBB"));
        assert_eq!(left.unwrap(), 4);
        assert_eq!(right.unwrap(), 4);
        vfs.release(fh).await.unwrap();

        assert_eq!(store.object("f").as_deref(), Some(&b"AAAABBBB"[..]));
    }

    #[tokio::test]
    async fn test_rename_and_stat_race() {
        let (_store, vfs) = create_test_env();
        write_file(&vfs, "a", b"x").await;

        let (renamed, stat) = tokio::join!(vfs.rename("a", "b"), vfs.stat("a"));
        renamed.unwrap();
        // Either before or after the rename, never a broken entry.
        match stat {
            Ok(attr) => assert!(attr.is_file()),
            Err(e) => assert!(matches!(e, VfsError::NotFound(_))),
        }
        assert!(vfs.stat("b").await.unwrap().is_file());
        assert_eq!(vfs.stats().locked_paths, 0);
    }
}

// =============================================================================
// STAGING AND SHUTDOWN
// =============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_disk_staging_round_trip() {
        let staging = tempfile::TempDir::new().unwrap();
        let (store, vfs) =
            create_test_env_with(VfsOptions::default().with_cache_dir(staging.path()));
        store.insert_object("f", b"hello world".to_vec(), at(1));

        let fh: FileHandle = vfs.open("f", OpenOptions::read_write()).await.unwrap();
        vfs.write(fh, 6, b"there").await.unwrap();
        assert_eq!(vfs.read(fh, 0, 64).await.unwrap(), b"hello there");
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 1);
        vfs.release(fh).await.unwrap();

        assert_eq!(store.object("f").as_deref(), Some(&b"hello there"[..]));
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let (store, vfs) = create_test_env();
        store.insert_object("kept", b"original".to_vec(), at(1));

        let reader: FileHandle = vfs.open("kept", OpenOptions::read_only()).await.unwrap();
        let editor: FileHandle = vfs.open("kept", OpenOptions::read_write()).await.unwrap();
        vfs.write(editor, 0, b"CHANGED!").await.unwrap();
        let draft: FileHandle = vfs.create("draft").await.unwrap();
        vfs.write(draft, 0, b"wip").await.unwrap();

        let before: VfsStats = vfs.stats();
        assert_eq!(before.open_handles, 3);
        assert_eq!(before.open_writers, 2);
        assert_eq!(before.pending_writes, 2);

        assert_eq!(vfs.shutdown().await, 3);

        let after: VfsStats = vfs.stats();
        assert_eq!(after.open_handles, 0);
        assert_eq!(after.pending_writes, 0);
        assert_eq!(store.keys(), vec!["kept".to_string()]);
        assert_eq!(store.object("kept").as_deref(), Some(&b"original"[..]));
        assert!(matches!(vfs.stat("draft").await, Err(VfsError::NotFound(_))));
        assert!(matches!(
            vfs.read(reader, 0, 1).await,
            Err(VfsError::BadHandle(_))
        ));
        assert_eq!(vfs.shutdown().await, 0);
    }
}
