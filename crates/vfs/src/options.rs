//! Configuration options for the VFS.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default directory permissions (rwxr-xr-x).
pub const DEFAULT_DIR_PERMS: u16 = 0o755;

/// Default file permissions (rw-r--r--).
pub const DEFAULT_FILE_PERMS: u16 = 0o644;

/// Configuration for a mounted VFS.
///
/// Loadable from JSON; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsOptions {
    /// How long a directory listing stays fresh before it is re-read.
    pub dir_cache_time_secs: u64,
    /// Translate tagged objects into symlinks.
    pub links: bool,
    /// Maximum symlinks followed while resolving one path.
    pub max_symlink_hops: u32,
    /// Permission bits reported for directories.
    pub dir_perms: u16,
    /// Permission bits reported for files.
    pub file_perms: u16,
    /// Stage open writers on disk here instead of in memory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for VfsOptions {
    fn default() -> Self {
        Self {
            dir_cache_time_secs: 300,
            links: true,
            max_symlink_hops: 40,
            dir_perms: DEFAULT_DIR_PERMS,
            file_perms: DEFAULT_FILE_PERMS,
            cache_dir: None,
        }
    }
}

impl VfsOptions {
    /// Parse options from a JSON document.
    ///
    /// # Arguments
    /// * `json` - JSON object; absent keys use defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Directory cache lifetime as a `Duration`.
    pub fn dir_cache_time(&self) -> Duration {
        Duration::from_secs(self.dir_cache_time_secs)
    }

    /// Set the directory cache lifetime.
    ///
    /// # Arguments
    /// * `ttl` - Listing lifetime (sub-second parts are dropped)
    pub fn with_dir_cache_time(mut self, ttl: Duration) -> Self {
        self.dir_cache_time_secs = ttl.as_secs();
        self
    }

    /// Enable or disable symlink translation.
    ///
    /// # Arguments
    /// * `links` - Whether tagged objects appear as symlinks
    pub fn with_links(mut self, links: bool) -> Self {
        self.links = links;
        self
    }

    /// Set the symlink hop limit.
    pub fn with_max_symlink_hops(mut self, hops: u32) -> Self {
        self.max_symlink_hops = hops;
        self
    }

    /// Set the reported permission bits.
    ///
    /// # Arguments
    /// * `dir_perms` - Directory permission bits
    /// * `file_perms` - File permission bits
    pub fn with_permissions(mut self, dir_perms: u16, file_perms: u16) -> Self {
        self.dir_perms = dir_perms;
        self.file_perms = file_perms;
        self
    }

    /// Stage writers on disk.
    ///
    /// # Arguments
    /// * `dir` - Directory for staged content
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}
