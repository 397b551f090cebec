//! In-memory object store.
//!
//! Behaves like a bucket-style backend: keys are flat, directories exist as
//! implied prefixes or explicit markers, and the optional primitives can be
//! switched off to exercise fallback paths. Faults can be injected per
//! operation and key.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StorageError;
use crate::traits::{ObjectInfo, ObjectStore, StoreCapabilities};

/// Backend operations, used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Get,
    Put,
    Delete,
    Move,
    SetModTime,
    CreateDir,
    RemoveDir,
}

impl StoreOp {
    fn name(self) -> &'static str {
        match self {
            StoreOp::List => "list",
            StoreOp::Get => "get",
            StoreOp::Put => "put",
            StoreOp::Delete => "delete",
            StoreOp::Move => "move",
            StoreOp::SetModTime => "set_mod_time",
            StoreOp::CreateDir => "create_dir",
            StoreOp::RemoveDir => "remove_dir",
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    mod_time: SystemTime,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Objects by key.
    objects: BTreeMap<String, StoredObject>,
    /// Explicit directory markers, each ending in `/`.
    dirs: BTreeSet<String>,
    /// One-shot faults to inject.
    faults: Vec<(StoreOp, String)>,
    /// Calls seen per operation.
    calls: HashMap<StoreOp, usize>,
}

impl StoreState {
    /// Count a call and consume a matching fault, if any.
    fn enter(&mut self, op: StoreOp, key: &str) -> Result<(), StorageError> {
        *self.calls.entry(op).or_insert(0) += 1;

        if let Some(pos) = self.faults.iter().position(|(o, k)| *o == op && k == key) {
            self.faults.remove(pos);
            tracing::debug!("Injecting {} fault for {:?}", op.name(), key);
            return Err(StorageError::Backend {
                operation: op.name(),
                key: key.to_string(),
                message: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    /// Check whether anything lives strictly below a prefix.
    fn has_descendants(&self, prefix: &str) -> bool {
        let object_below: bool = self
            .objects
            .range(prefix.to_string()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(prefix));
        let dir_below: bool = self
            .dirs
            .range(prefix.to_string()..)
            .any(|d| d.starts_with(prefix) && d != prefix);
        object_below || dir_below
    }
}

/// Object store held entirely in memory.
#[derive(Debug)]
pub struct MemoryObjectStore {
    state: Mutex<StoreState>,
    capabilities: StoreCapabilities,
}

impl MemoryObjectStore {
    /// Create an empty store with every optional primitive available.
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities::default())
    }

    /// Create an empty store with the given capabilities.
    ///
    /// # Arguments
    /// * `capabilities` - Which optional primitives to provide
    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            capabilities,
        }
    }

    /// Make the next `op` call against `key` fail with a backend error.
    ///
    /// # Arguments
    /// * `op` - Operation to fail
    /// * `key` - Exact key (or prefix for listings and directory calls)
    pub fn fail_next(&self, op: StoreOp, key: impl Into<String>) {
        self.state.lock().faults.push((op, key.into()));
    }

    /// Number of calls seen for an operation, including failed ones.
    pub fn call_count(&self, op: StoreOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Write an object directly, bypassing capability checks and faults.
    ///
    /// Models another client mutating the bucket.
    pub fn insert_object(&self, key: impl Into<String>, data: Vec<u8>, mod_time: SystemTime) {
        self.state
            .lock()
            .objects
            .insert(key.into(), StoredObject { data, mod_time });
    }

    /// Remove an object directly, bypassing faults.
    pub fn remove_object(&self, key: &str) -> bool {
        self.state.lock().objects.remove(key).is_some()
    }

    /// Read an object's content directly.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(key).map(|o| o.data.clone())
    }

    /// Read an object's recorded modification time directly.
    pub fn object_mod_time(&self, key: &str) -> Option<SystemTime> {
        self.state.lock().objects.get(key).map(|o| o.mod_time)
    }

    /// All object keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Check whether an explicit directory marker exists.
    pub fn has_dir(&self, prefix: &str) -> bool {
        self.state.lock().dirs.contains(prefix)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::List, prefix)?;

        let mut entries: BTreeMap<String, ObjectInfo> = BTreeMap::new();

        for (key, obj) in state.objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match rest.find('/') {
                Some(pos) => {
                    let sub: String = format!("{}{}/", prefix, &rest[..pos]);
                    entries.entry(sub.clone()).or_insert_with(|| ObjectInfo::prefix(sub));
                }
                None => {
                    entries.insert(
                        key.clone(),
                        ObjectInfo::object(key.clone(), obj.data.len() as u64, Some(obj.mod_time)),
                    );
                }
            }
        }

        for dir in state.dirs.range(prefix.to_string()..) {
            let Some(rest) = dir.strip_prefix(prefix) else {
                break;
            };
            if rest.is_empty() {
                continue;
            }
            if let Some(pos) = rest.find('/') {
                let sub: String = format!("{}{}/", prefix, &rest[..pos]);
                entries.entry(sub.clone()).or_insert_with(|| ObjectInfo::prefix(sub));
            }
        }

        if entries.is_empty() && !prefix.is_empty() && !state.dirs.contains(prefix) {
            return Err(StorageError::not_found(prefix));
        }

        Ok(entries.into_values().collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::Get, key)?;
        state
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn put(
        &self,
        key: &str,
        data: &[u8],
        mod_time: Option<SystemTime>,
    ) -> Result<ObjectInfo, StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::Put, key)?;

        // Backends without mod_time_on_put stamp the upload completion time.
        let recorded: SystemTime = match mod_time {
            Some(t) if self.capabilities.mod_time_on_put => t,
            _ => SystemTime::now(),
        };
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.to_vec(),
                mod_time: recorded,
            },
        );

        Ok(ObjectInfo::object(key, data.len() as u64, Some(recorded)))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::Delete, key)?;
        state
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(key))
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::Move, src)?;

        if !self.capabilities.server_side_move {
            return Err(StorageError::Unsupported { operation: "move" });
        }

        let obj: StoredObject = state
            .objects
            .remove(src)
            .ok_or_else(|| StorageError::not_found(src))?;
        state.objects.insert(dst.to_string(), obj);
        Ok(())
    }

    async fn set_mod_time(&self, key: &str, mod_time: SystemTime) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::SetModTime, key)?;

        if !self.capabilities.set_mod_time {
            return Err(StorageError::Unsupported {
                operation: "set_mod_time",
            });
        }

        let obj: &mut StoredObject = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StorageError::not_found(key))?;
        obj.mod_time = mod_time;
        Ok(())
    }

    async fn create_dir(&self, prefix: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::CreateDir, prefix)?;
        state.dirs.insert(prefix.to_string());
        Ok(())
    }

    async fn remove_dir(&self, prefix: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.enter(StoreOp::RemoveDir, prefix)?;

        if state.has_descendants(prefix) {
            return Err(StorageError::DirectoryNotEmpty {
                prefix: prefix.to_string(),
            });
        }
        if !state.dirs.remove(prefix) {
            return Err(StorageError::not_found(prefix));
        }
        Ok(())
    }
}
