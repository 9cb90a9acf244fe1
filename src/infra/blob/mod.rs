//! Blob storage backends.
//!
//! Blob storage doubles as the event-trigger substrate for actions: writing an
//! object into the action-parameters bucket fires an event carrying the
//! object's name.

pub mod memory;

use chrono::Duration;

use crate::core::CoordinatorResult;

pub use memory::{BlobEvent, InMemoryBlobStore};

/// Addressable binary object storage collaborator.
pub trait BlobStore: Send + Sync {
    /// Write an object, replacing any previous content.
    fn write(&self, bucket: &str, name: &str, content_type: &str, data: Vec<u8>) -> CoordinatorResult<()>;
    /// Read an object, `None` when absent.
    fn read(&self, bucket: &str, name: &str) -> CoordinatorResult<Option<Vec<u8>>>;
    /// Delete an object; deleting a missing object is not an error.
    fn delete(&self, bucket: &str, name: &str) -> CoordinatorResult<()>;
    /// Names of objects whose name starts with `prefix`, in name order.
    fn list(&self, bucket: &str, prefix: &str) -> CoordinatorResult<Vec<String>>;
    /// Short-lived download URL, `None` when the object does not exist.
    fn signed_url(&self, bucket: &str, name: &str, ttl: Duration) -> CoordinatorResult<Option<String>>;
}

/// Delete every object under `prefix`, returning how many were removed.
///
/// # Errors
///
/// Propagates listing or deletion failures.
pub fn delete_prefix(blobs: &dyn BlobStore, bucket: &str, prefix: &str) -> CoordinatorResult<usize> {
    let names = blobs.list(bucket, prefix)?;
    for name in &names {
        blobs.delete(bucket, name)?;
    }
    Ok(names.len())
}
