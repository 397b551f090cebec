//! Pending modification times for files open for writing.
//!
//! Object stores fix an object's modification time when it is uploaded, and
//! the upload of a written file only happens when its last handle closes. A
//! time set while the file is still open is therefore held here, keyed by
//! path, and applied when the upload is confirmed.

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;

/// Outcome of an explicit time-set request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSetOutcome {
    /// A writer is open; the time is recorded and applied on completion.
    Deferred,
    /// No writer is open; the caller applies the time now.
    Immediate,
}

/// Time to stamp on a file whose upload was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCompletion {
    /// Intended time if one was recorded, otherwise the completion time.
    pub mod_time: SystemTime,
    /// Whether `mod_time` came from an explicit request.
    pub intended: bool,
}

#[derive(Debug, Default)]
struct PendingWrite {
    /// Handles open for writing on this path.
    writers: usize,
    /// Last time requested while open; later requests replace earlier ones.
    intended: Option<SystemTime>,
}

/// Path-keyed side table of intended modification times.
///
/// An entry lives exactly as long as at least one handle has the path open
/// for writing, so no intended time outlives the opens it was set under.
#[derive(Debug, Default)]
pub struct ModTimeReconciler {
    pending: Mutex<HashMap<String, PendingWrite>>,
}

impl ModTimeReconciler {
    /// Create an empty reconciler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle opened for writing.
    pub fn on_open_for_write(&self, path: &str) {
        self.pending
            .lock()
            .entry(path.to_string())
            .or_default()
            .writers += 1;
    }

    /// Record the time a file should carry once its upload completes.
    ///
    /// # Returns
    /// False if no writer is open on the path; nothing is recorded then.
    pub fn set_intended_mod_time(&self, path: &str, time: SystemTime) -> bool {
        match self.pending.lock().get_mut(path) {
            Some(entry) => {
                entry.intended = Some(time);
                true
            }
            None => false,
        }
    }

    /// Route an explicit time-set request.
    ///
    /// # Arguments
    /// * `path` - File whose time is being set
    /// * `time` - Requested modification time
    pub fn on_explicit_time_set(&self, path: &str, time: SystemTime) -> TimeSetOutcome {
        if self.set_intended_mod_time(path, time) {
            tracing::debug!("Deferring mod time for {} until upload completes", path);
            TimeSetOutcome::Deferred
        } else {
            TimeSetOutcome::Immediate
        }
    }

    /// Intended time recorded for an open file, if any.
    pub fn intended_mod_time(&self, path: &str) -> Option<SystemTime> {
        self.pending.lock().get(path).and_then(|e| e.intended)
    }

    /// Check whether a handle has the path open for writing.
    pub fn is_open_for_write(&self, path: &str) -> bool {
        self.pending.lock().contains_key(path)
    }

    /// Release a writer whose upload was confirmed.
    ///
    /// The intended time is consumed; another writer still open on the
    /// path starts over with none.
    pub fn on_write_complete(&self, path: &str) -> WriteCompletion {
        let intended: Option<SystemTime> = self.release(path, true);
        WriteCompletion {
            mod_time: intended.unwrap_or_else(SystemTime::now),
            intended: intended.is_some(),
        }
    }

    /// Release a writer whose content was never uploaded.
    ///
    /// The intended time is discarded once no writer remains.
    pub fn on_write_aborted(&self, path: &str) {
        if let Some(time) = self.release(path, false) {
            tracing::debug!("Discarding pending mod time {:?} for {}", time, path);
        }
    }

    fn release(&self, path: &str, consume: bool) -> Option<SystemTime> {
        let mut pending = self.pending.lock();
        let entry: &mut PendingWrite = pending.get_mut(path)?;

        entry.writers = entry.writers.saturating_sub(1);
        let last: bool = entry.writers == 0;
        let intended: Option<SystemTime> = if consume || last {
            entry.intended.take()
        } else {
            None
        };
        if last {
            pending.remove(path);
        }
        intended
    }

    /// Re-key entries after a rename, including entries below a directory.
    pub fn rename(&self, old_path: &str, new_path: &str) {
        let mut pending = self.pending.lock();
        let moved: Vec<String> = pending
            .keys()
            .filter(|k| crate::path::is_same_or_descendant(old_path, k))
            .cloned()
            .collect();

        for key in moved {
            if let Some(entry) = pending.remove(&key) {
                let renamed: String = format!("{}{}", new_path, &key[old_path.len()..]);
                pending.insert(renamed, entry);
            }
        }
    }

    /// Drop every pending entry.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Number of paths with open writers.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
