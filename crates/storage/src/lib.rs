//! Object-store abstraction for the objmount virtual filesystem.
//!
//! The VFS core consumes backends only through the [`ObjectStore`] trait:
//! delimited listing, whole-object get/put/delete, and the optional
//! primitives advertised by [`StoreCapabilities`] (server-side move,
//! modification time on upload, metadata time updates).
//!
//! [`MemoryObjectStore`] is a complete in-process backend with switchable
//! capabilities and fault injection, used to exercise fallback paths.

mod error;
mod memory;
mod traits;

pub use error::StorageError;
pub use memory::{MemoryObjectStore, StoreOp};
pub use traits::{ObjectInfo, ObjectStore, StoreCapabilities};
