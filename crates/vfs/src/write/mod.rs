//! Write support for the VFS.
//!
//! Open writers stage their content in a [`WriteCache`] and upload it as a
//! whole on release. Modification times requested while a file is open are
//! held by the [`ModTimeReconciler`] until that upload is confirmed.

mod cache;
mod modtime;

pub use cache::{MaterializedCache, MemoryWriteCache, WriteCache, WriteCacheError};
pub use modtime::{ModTimeReconciler, TimeSetOutcome, WriteCompletion};
