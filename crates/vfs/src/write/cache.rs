//! Write cache implementations for staged file content.
//!
//! Every handle open for writing owns one staging entry, addressed by a
//! staging key. Content is edited in place here and uploaded as a whole
//! when the handle is released.
//!
//! Provides both disk-based (MaterializedCache) and in-memory (MemoryWriteCache)
//! implementations of the WriteCache trait.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

/// Errors from write cache operations.
#[derive(Debug, Error)]
pub enum WriteCacheError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No staging entry for the key.
    #[error("Staging entry not found: {0}")]
    NotFound(String),

    /// Write or resize past the largest size this cache can stage.
    #[error("Staged size for {key} out of range: offset {offset} + {len} bytes")]
    TooLarge {
        /// Staging key.
        key: String,
        /// Requested offset or length.
        offset: u64,
        /// Bytes to write at the offset.
        len: u64,
    },
}

/// Largest staged size [`MemoryWriteCache`] accepts by default (4 GiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 4 << 30;

/// Largest offset a staging file can be seeked to.
const MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// End of a write of `len` bytes at `offset`, if it stays within `limit`.
fn staged_end(key: &str, offset: u64, len: u64, limit: u64) -> Result<u64, WriteCacheError> {
    offset
        .checked_add(len)
        .filter(|end| *end <= limit)
        .ok_or_else(|| WriteCacheError::TooLarge {
            key: key.to_string(),
            offset,
            len,
        })
}

/// Trait for staging-buffer implementations.
///
/// Allows swapping cache backends for testing or alternative storage.
#[async_trait]
pub trait WriteCache: Send + Sync {
    /// Replace the staged content for a key, creating the entry if needed.
    ///
    /// # Arguments
    /// * `key` - Staging key
    /// * `data` - Initial content
    async fn load(&self, key: &str, data: &[u8]) -> Result<(), WriteCacheError>;

    /// Write bytes at an offset, zero-filling any gap past the current end.
    ///
    /// # Arguments
    /// * `key` - Staging key
    /// * `offset` - Byte offset
    /// * `data` - Bytes to write
    ///
    /// # Returns
    /// Number of bytes written.
    async fn write_at(&self, key: &str, offset: u64, data: &[u8])
        -> Result<usize, WriteCacheError>;

    /// Read up to `size` bytes at an offset.
    ///
    /// # Returns
    /// The bytes read; empty at or past the end.
    async fn read_at(&self, key: &str, offset: u64, size: usize)
        -> Result<Vec<u8>, WriteCacheError>;

    /// Set the staged length, zero-extending or cutting as needed.
    async fn truncate(&self, key: &str, size: u64) -> Result<(), WriteCacheError>;

    /// Current staged length.
    async fn size(&self, key: &str) -> Result<u64, WriteCacheError>;

    /// Entire staged content, for upload.
    async fn read_all(&self, key: &str) -> Result<Vec<u8>, WriteCacheError>;

    /// Drop a staging entry. Missing entries are ignored.
    async fn remove(&self, key: &str) -> Result<(), WriteCacheError>;

    /// Get cache directory path, if the cache lives on disk.
    fn cache_dir(&self) -> Option<&Path>;
}

/// In-memory write cache.
///
/// Stores all data in memory, no disk I/O. Each entry is capped at a
/// maximum size so a sparse write far past the end fails instead of
/// allocating the gap.
pub struct MemoryWriteCache {
    /// Staged content by key.
    files: RwLock<HashMap<String, Vec<u8>>>,
    /// Largest staged size per entry.
    max_size: u64,
}

impl MemoryWriteCache {
    /// Create a new empty memory cache.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MEMORY_LIMIT)
    }

    /// Create a memory cache with a custom per-entry size cap.
    pub fn with_max_size(max_size: u64) -> Self {
        let addressable: u64 = u64::try_from(usize::MAX).unwrap_or(u64::MAX);
        Self {
            files: RwLock::new(HashMap::new()),
            max_size: max_size.min(addressable),
        }
    }

    /// Number of live staging entries.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// Check whether no staging entries exist.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Default for MemoryWriteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WriteCache for MemoryWriteCache {
    async fn load(&self, key: &str, data: &[u8]) -> Result<(), WriteCacheError> {
        self.files.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn write_at(
        &self,
        key: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, WriteCacheError> {
        let end: u64 = staged_end(key, offset, data.len() as u64, self.max_size)?;
        let (start, end): (usize, usize) = (offset as usize, end as usize);

        let mut files = self.files.write();
        let content: &mut Vec<u8> = files.entry(key.to_string()).or_default();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn read_at(
        &self,
        key: &str,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, WriteCacheError> {
        let files = self.files.read();
        let content: &Vec<u8> = files
            .get(key)
            .ok_or_else(|| WriteCacheError::NotFound(key.to_string()))?;

        let start: usize = (offset as usize).min(content.len());
        let end: usize = start.saturating_add(size).min(content.len());
        Ok(content[start..end].to_vec())
    }

    async fn truncate(&self, key: &str, size: u64) -> Result<(), WriteCacheError> {
        staged_end(key, size, 0, self.max_size)?;
        let mut files = self.files.write();
        files
            .entry(key.to_string())
            .or_default()
            .resize(size as usize, 0);
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64, WriteCacheError> {
        self.files
            .read()
            .get(key)
            .map(|c| c.len() as u64)
            .ok_or_else(|| WriteCacheError::NotFound(key.to_string()))
    }

    async fn read_all(&self, key: &str) -> Result<Vec<u8>, WriteCacheError> {
        self.files
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| WriteCacheError::NotFound(key.to_string()))
    }

    async fn remove(&self, key: &str) -> Result<(), WriteCacheError> {
        self.files.write().remove(key);
        Ok(())
    }

    fn cache_dir(&self) -> Option<&Path> {
        None
    }
}

/// Disk-backed write cache.
///
/// Each staging key maps to one flat file directly under the cache
/// directory, so large writes do not have to fit in memory.
///
/// # Directory Structure
/// ```text
/// cache_dir/
/// ├── handle-7          # Staged content of handle 7
/// └── handle-9.tmp      # Initial load in progress
/// ```
pub struct MaterializedCache {
    /// Root directory for cache storage.
    cache_dir: PathBuf,
}

impl MaterializedCache {
    /// Create a new materialized cache.
    ///
    /// # Arguments
    /// * `cache_dir` - Root directory for cache storage
    ///
    /// # Returns
    /// New cache instance. Creates the directory if needed.
    pub fn new(cache_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    /// Get path to the staging file for a key.
    fn staging_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key.replace('/', "_"))
    }

    fn open_existing(&self, key: &str) -> Result<File, WriteCacheError> {
        let path: PathBuf = self.staging_path(key);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => WriteCacheError::NotFound(key.to_string()),
                _ => WriteCacheError::Io(e),
            })
    }
}

#[async_trait]
impl WriteCache for MaterializedCache {
    async fn load(&self, key: &str, data: &[u8]) -> Result<(), WriteCacheError> {
        let full_path: PathBuf = self.staging_path(key);

        // Write file atomically (write to temp, then rename)
        let temp_path: PathBuf = full_path.with_extension("tmp");
        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &full_path)?;

        Ok(())
    }

    async fn write_at(
        &self,
        key: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, WriteCacheError> {
        staged_end(key, offset, data.len() as u64, MAX_FILE_SIZE)?;
        let mut file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.staging_path(key))?;

        // Seeking past the end leaves a zero-filled hole.
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    async fn read_at(
        &self,
        key: &str,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, WriteCacheError> {
        let mut file: File = self.open_existing(key)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf: Vec<u8> = Vec::with_capacity(size);
        file.take(size as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    async fn truncate(&self, key: &str, size: u64) -> Result<(), WriteCacheError> {
        staged_end(key, size, 0, MAX_FILE_SIZE)?;
        let file: File = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.staging_path(key))?;
        file.set_len(size)?;
        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64, WriteCacheError> {
        let file: File = self.open_existing(key)?;
        Ok(file.metadata()?.len())
    }

    async fn read_all(&self, key: &str) -> Result<Vec<u8>, WriteCacheError> {
        let mut file: File = self.open_existing(key)?;
        let mut buf: Vec<u8> = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    async fn remove(&self, key: &str) -> Result<(), WriteCacheError> {
        match std::fs::remove_file(self.staging_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn cache_dir(&self) -> Option<&Path> {
        Some(&self.cache_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(cache: &dyn WriteCache) {
        cache.load("h1", b"hello world").await.unwrap();
        cache.write_at("h1", 6, b"there").await.unwrap();
        assert_eq!(cache.read_all("h1").await.unwrap(), b"hello there");

        cache.write_at("h1", 13, b"!").await.unwrap();
        assert_eq!(cache.size("h1").await.unwrap(), 14);
        assert_eq!(cache.read_at("h1", 11, 10).await.unwrap(), vec![0, 0, b'!']);

        cache.truncate("h1", 5).await.unwrap();
        assert_eq!(cache.read_all("h1").await.unwrap(), b"hello");
        assert!(cache.read_at("h1", 50, 4).await.unwrap().is_empty());

        cache.remove("h1").await.unwrap();
        assert!(matches!(
            cache.size("h1").await,
            Err(WriteCacheError::NotFound(_))
        ));
        cache.remove("h1").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_cache_edit_in_place() {
        let cache: MemoryWriteCache = MemoryWriteCache::new();
        exercise(&cache).await;
        assert!(cache.is_empty());
        assert!(cache.cache_dir().is_none());
    }

    #[tokio::test]
    async fn test_materialized_cache_edit_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let cache: MaterializedCache =
            MaterializedCache::new(temp.path().join("staging")).unwrap();

        exercise(&cache).await;
        assert!(cache.cache_dir().unwrap().ends_with("staging"));
    }

    #[tokio::test]
    async fn test_memory_cache_rejects_out_of_range_writes() {
        let cache: MemoryWriteCache = MemoryWriteCache::with_max_size(16);
        cache.load("h1", b"abc").await.unwrap();

        assert!(matches!(
            cache.write_at("h1", u64::MAX, b"x").await,
            Err(WriteCacheError::TooLarge { .. })
        ));
        assert!(matches!(
            cache.write_at("h1", 1 << 40, b"x").await,
            Err(WriteCacheError::TooLarge { .. })
        ));
        assert!(matches!(
            cache.truncate("h1", 17).await,
            Err(WriteCacheError::TooLarge { .. })
        ));

        // Up to the cap is fine and nothing was changed by the failures.
        assert_eq!(cache.read_all("h1").await.unwrap(), b"abc");
        cache.write_at("h1", 15, b"z").await.unwrap();
        assert_eq!(cache.size("h1").await.unwrap(), 16);
    }

    #[tokio::test]
    async fn test_materialized_cache_rejects_overflowing_offset() {
        let temp = tempfile::tempdir().unwrap();
        let cache: MaterializedCache = MaterializedCache::new(temp.path().to_path_buf()).unwrap();
        cache.load("h1", b"abc").await.unwrap();

        assert!(matches!(
            cache.write_at("h1", u64::MAX - 1, b"xyz").await,
            Err(WriteCacheError::TooLarge { .. })
        ));
        assert_eq!(cache.read_all("h1").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_write_creates_entry() {
        let cache: MemoryWriteCache = MemoryWriteCache::new();
        cache.write_at("new", 2, b"ab").await.unwrap();
        assert_eq!(cache.read_all("new").await.unwrap(), vec![0, 0, b'a', b'b']);
        assert_eq!(cache.len(), 1);
    }
}
