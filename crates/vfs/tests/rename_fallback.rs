//! Integration tests for rename.
//!
//! Tests cover:
//! - POSIX replacement rules
//! - server-side move versus copy-then-delete
//! - faults at each step of the copy fallback
//! - directory renames and their rollback

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use objmount_vfs::{
    DirEntry, FileHandle, MemoryObjectStore, StoreCapabilities, StoreOp, Vfs, VfsError,
    VfsOptions,
};

/// Helper to create a test environment backed by a store with server-side move.
fn create_test_env() -> (Arc<MemoryObjectStore>, Vfs) {
    let store: Arc<MemoryObjectStore> = Arc::new(MemoryObjectStore::new());
    let vfs: Vfs = Vfs::new(store.clone(), VfsOptions::default()).unwrap();
    (store, vfs)
}

/// Helper to create a test environment whose store can only copy and delete.
fn create_copy_only_env() -> (Arc<MemoryObjectStore>, Vfs) {
    let store: Arc<MemoryObjectStore> =
        Arc::new(MemoryObjectStore::with_capabilities(StoreCapabilities {
            server_side_move: false,
            mod_time_on_put: true,
            set_mod_time: true,
        }));
    let vfs: Vfs = Vfs::new(store.clone(), VfsOptions::default()).unwrap();
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
// POSIX RULES
// =============================================================================

mod posix_rules {
    use super::*;

    #[tokio::test]
    async fn test_file_replaces_file() {
        let (store, vfs) = create_test_env();
        write_file(&vfs, "src", b"new").await;
        write_file(&vfs, "dst", b"old content").await;

        vfs.rename("src", "dst").await.unwrap();

        assert_eq!(store.keys(), vec!["dst".to_string()]);
        assert_eq!(store.object("dst").as_deref(), Some(&b"new"[..]));
        assert_eq!(vfs.stat("dst").await.unwrap().size, 3);
        assert_eq!(names(&vfs.readdir("").await.unwrap()), vec!["dst"]);
    }

    #[tokio::test]
    async fn test_link_replaces_file_and_old_key_goes() {
        let (store, vfs) = create_test_env();
        vfs.symlink("somewhere", "link").await.unwrap();
        write_file(&vfs, "plain", b"x").await;

        vfs.rename("link", "plain").await.unwrap();

        assert_eq!(store.keys(), vec!["plain.rclonelink".to_string()]);
        assert!(vfs.stat("plain").await.unwrap().is_symlink());
        assert_eq!(vfs.readlink("plain").await.unwrap(), "somewhere");
    }

    #[tokio::test]
    async fn test_type_mismatches_are_rejected() {
        let (_store, vfs) = create_test_env();
        vfs.mkdir("dir").await.unwrap();
        vfs.mkdir("full").await.unwrap();
        write_file(&vfs, "full/child", b"x").await;
        write_file(&vfs, "file", b"x").await;

        assert!(matches!(
            vfs.rename("file", "dir").await,
            Err(VfsError::IsDirectory(_))
        ));
        assert!(matches!(
            vfs.rename("dir", "file").await,
            Err(VfsError::NotDirectory(_))
        ));
        let err: VfsError = vfs.rename("dir", "full").await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOTEMPTY);
        assert!(matches!(
            vfs.rename("dir", "dir/inner").await,
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            vfs.rename("missing", "anywhere").await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_replaces_empty_directory() {
        let (store, vfs) = create_test_env();
        vfs.mkdir("src").await.unwrap();
        write_file(&vfs, "src/f", b"x").await;
        vfs.mkdir("dst").await.unwrap();

        vfs.rename("src", "dst").await.unwrap();

        assert_eq!(names(&vfs.readdir("dst").await.unwrap()), vec!["f"]);
        assert!(store.has_dir("dst/"));
        assert!(!store.has_dir("src/"));
        assert_eq!(store.keys(), vec!["dst/f".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_onto_itself_is_noop() {
        let (store, vfs) = create_test_env();
        write_file(&vfs, "same", b"x").await;

        vfs.rename("same", "/same/").await.unwrap();
        assert_eq!(store.call_count(StoreOp::Move), 0);
        assert_eq!(store.object("same").as_deref(), Some(&b"x"[..]));
    }
}

// =============================================================================
// SERVER-SIDE MOVE
// =============================================================================

mod server_side {
    use super::*;

    #[tokio::test]
    async fn test_move_does_not_copy() {
        let (store, vfs) = create_test_env();
        store.insert_object("a", b"payload".to_vec(), at(500));

        vfs.rename("a", "b").await.unwrap();

        assert_eq!(store.call_count(StoreOp::Move), 1);
        assert_eq!(store.call_count(StoreOp::Get), 0);
        assert_eq!(store.call_count(StoreOp::Put), 0);
        assert_eq!(store.object_mod_time("b"), Some(at(500)));
    }

    #[tokio::test]
    async fn test_move_failure_leaves_source() {
        let (store, vfs) = create_test_env();
        store.insert_object("a", b"payload".to_vec(), at(500));
        vfs.stat("a").await.unwrap();
        store.fail_next(StoreOp::Move, "a");

        let err: VfsError = vfs.rename("a", "b").await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
        assert!(vfs.stat("a").await.is_ok());
        assert!(matches!(vfs.stat("b").await, Err(VfsError::NotFound(_))));
    }
}

// =============================================================================
// COPY FALLBACK
// =============================================================================

mod copy_fallback {
    use super::*;

    #[tokio::test]
    async fn test_copy_then_delete_keeps_content_and_time() {
        let (store, vfs) = create_copy_only_env();
        store.insert_object("a", b"payload".to_vec(), at(500));

        vfs.rename("a", "b").await.unwrap();

        assert_eq!(store.keys(), vec!["b".to_string()]);
        assert_eq!(store.object("b").as_deref(), Some(&b"payload"[..]));
        assert_eq!(store.object_mod_time("b"), Some(at(500)));
        assert_eq!(vfs.stat("b").await.unwrap().mtime, at(500));
        assert_eq!(store.call_count(StoreOp::Get), 1);
        assert_eq!(store.call_count(StoreOp::Put), 1);
        assert_eq!(store.call_count(StoreOp::Delete), 1);
    }

    #[tokio::test]
    async fn test_failed_read_leaves_source() {
        let (store, vfs) = create_copy_only_env();
        store.insert_object("a", b"payload".to_vec(), at(500));
        store.fail_next(StoreOp::Get, "a");

        assert!(vfs.rename("a", "b").await.is_err());
        assert_eq!(store.keys(), vec!["a".to_string()]);
        assert!(vfs.stat("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_source() {
        let (store, vfs) = create_copy_only_env();
        store.insert_object("a", b"payload".to_vec(), at(500));
        store.fail_next(StoreOp::Put, "b");

        assert!(vfs.rename("a", "b").await.is_err());
        assert_eq!(store.keys(), vec!["a".to_string()]);
        assert!(matches!(vfs.stat("b").await, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_source_delete_removes_copy() {
        let (store, vfs) = create_copy_only_env();
        store.insert_object("a", b"payload".to_vec(), at(500));
        store.fail_next(StoreOp::Delete, "a");

        assert!(vfs.rename("a", "b").await.is_err());

        // Exactly one of source and destination survives.
        assert_eq!(store.keys(), vec!["a".to_string()]);
        assert_eq!(store.object("a").as_deref(), Some(&b"payload"[..]));
        assert!(vfs.stat("a").await.is_ok());
        assert!(matches!(vfs.stat("b").await, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_link_copy_preserves_target() {
        let (store, vfs) = create_copy_only_env();
        vfs.symlink("../elsewhere", "l").await.unwrap();

        vfs.rename("l", "renamed").await.unwrap();

        assert_eq!(
            store.object("renamed.rclonelink").as_deref(),
            Some(&b"../elsewhere"[..])
        );
        assert_eq!(vfs.readlink("renamed").await.unwrap(), "../elsewhere");
    }
}

// =============================================================================
// DIRECTORY RENAME
// =============================================================================

mod directory_rename {
    use super::*;

    /// Build `d/a`, `d/l -> a` and `d/sub/b`.
    async fn populate(vfs: &Vfs) {
        vfs.mkdir("d").await.unwrap();
        write_file(vfs, "d/a", b"A").await;
        vfs.symlink("a", "d/l").await.unwrap();
        vfs.mkdir("d/sub").await.unwrap();
        write_file(vfs, "d/sub/b", b"B").await;
    }

    #[tokio::test]
    async fn test_directory_moves_whole_subtree() {
        let (store, vfs) = create_copy_only_env();
        populate(&vfs).await;
        let sub_ino: u64 = vfs.stat("d/sub").await.unwrap().ino;

        vfs.rename("d", "e").await.unwrap();

        assert_eq!(
            store.keys(),
            vec![
                "e/a".to_string(),
                "e/l.rclonelink".to_string(),
                "e/sub/b".to_string(),
            ]
        );
        assert!(store.has_dir("e/") && store.has_dir("e/sub/"));
        assert!(!store.has_dir("d/") && !store.has_dir("d/sub/"));

        assert_eq!(names(&vfs.readdir("e").await.unwrap()), vec!["a", "l", "sub"]);
        assert_eq!(vfs.readlink("e/l").await.unwrap(), "a");
        assert_eq!(vfs.stat("e/sub").await.unwrap().ino, sub_ino);
        assert!(matches!(vfs.stat("d").await, Err(VfsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_directory_move_rolls_back() {
        let (store, vfs) = create_copy_only_env();
        populate(&vfs).await;
        store.fail_next(StoreOp::Put, "e/sub/b");

        assert!(vfs.rename("d", "e").await.is_err());

        assert_eq!(
            store.keys(),
            vec![
                "d/a".to_string(),
                "d/l.rclonelink".to_string(),
                "d/sub/b".to_string(),
            ]
        );
        assert!(!store.has_dir("e/") && !store.has_dir("e/sub/"));
        assert!(store.has_dir("d/"));

        assert_eq!(names(&vfs.readdir("d").await.unwrap()), vec!["a", "l", "sub"]);
        assert!(matches!(vfs.stat("e").await, Err(VfsError::NotFound(_))));
        assert_eq!(vfs.readlink("d/l").await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_implicit_directory_moves() {
        let (store, vfs) = create_test_env();
        store.insert_object("x/1", b"1".to_vec(), at(1));
        store.insert_object("x/y/2", b"2".to_vec(), at(2));

        vfs.rename("x", "z").await.unwrap();

        assert_eq!(store.keys(), vec!["z/1".to_string(), "z/y/2".to_string()]);
        assert_eq!(store.object_mod_time("z/y/2"), Some(at(2)));
        assert_eq!(names(&vfs.readdir("z/y").await.unwrap()), vec!["2"]);
    }
}
