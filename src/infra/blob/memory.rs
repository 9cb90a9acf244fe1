//! In-memory blob storage with object-finalize notifications.

use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, Utc};
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::BlobStore;
use crate::core::{CoordinatorError, CoordinatorResult};

/// Notification that an object was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEvent {
    /// Bucket the object landed in.
    pub bucket: String,
    /// Object name.
    pub name: String,
}

struct StoredBlob {
    content_type: String,
    data: Vec<u8>,
}

/// Blob storage held in process memory.
#[derive(Default)]
pub struct InMemoryBlobStore {
    buckets: Mutex<HashMap<String, BTreeMap<String, StoredBlob>>>,
    watchers: Mutex<Vec<(String, Sender<BlobEvent>)>>,
}

impl InMemoryBlobStore {
    /// Create empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a [`BlobEvent`] on `sender` for every write into `bucket`.
    pub fn watch(&self, bucket: impl Into<String>, sender: Sender<BlobEvent>) {
        self.watchers.lock().push((bucket.into(), sender));
    }

    /// Content type recorded for an object.
    #[must_use]
    pub fn content_type(&self, bucket: &str, name: &str) -> Option<String> {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.get(name))
            .map(|b| b.content_type.clone())
    }

    /// Number of objects in `bucket`.
    #[must_use]
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.lock().get(bucket).map_or(0, BTreeMap::len)
    }

    /// Whether `bucket` holds no objects.
    #[must_use]
    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }
}

impl BlobStore for InMemoryBlobStore {
    fn write(&self, bucket: &str, name: &str, content_type: &str, data: Vec<u8>) -> CoordinatorResult<()> {
        self.buckets.lock().entry(bucket.to_string()).or_default().insert(
            name.to_string(),
            StoredBlob {
                content_type: content_type.to_string(),
                data,
            },
        );
        let watchers = self.watchers.lock();
        for (watched, sender) in watchers.iter().filter(|(b, _)| b == bucket) {
            sender
                .send(BlobEvent {
                    bucket: watched.clone(),
                    name: name.to_string(),
                })
                .map_err(|e| CoordinatorError::Backend(format!("event channel closed: {e}")))?;
        }
        Ok(())
    }

    fn read(&self, bucket: &str, name: &str) -> CoordinatorResult<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.get(name))
            .map(|b| b.data.clone()))
    }

    fn delete(&self, bucket: &str, name: &str) -> CoordinatorResult<()> {
        if let Some(b) = self.buckets.lock().get_mut(bucket) {
            b.remove(name);
        }
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> CoordinatorResult<Vec<String>> {
        Ok(self
            .buckets
            .lock()
            .get(bucket)
            .map(|b| {
                b.keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn signed_url(&self, bucket: &str, name: &str, ttl: Duration) -> CoordinatorResult<Option<String>> {
        let exists = self
            .buckets
            .lock()
            .get(bucket)
            .is_some_and(|b| b.contains_key(name));
        if !exists {
            return Ok(None);
        }
        let expires = (Utc::now() + ttl).timestamp();
        Ok(Some(format!("memory://{bucket}/{name}?expires={expires}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::blob::delete_prefix;

    #[test]
    fn test_write_notifies_bucket_watchers_only() {
        let store = InMemoryBlobStore::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        store.watch("params", tx);
        store.write("params", "a.json", "application/json", b"{}".to_vec()).unwrap();
        store.write("data", "b.bin", "application/octet-stream", vec![1]).unwrap();
        assert_eq!(rx.try_recv().unwrap().name, "a.json");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_delete_prefix_and_signed_url() {
        let store = InMemoryBlobStore::new();
        store.write("data", "m/1", "text/plain", vec![1]).unwrap();
        store.write("data", "m/2", "text/plain", vec![2]).unwrap();
        store.write("data", "n/1", "text/plain", vec![3]).unwrap();
        assert!(store.signed_url("data", "m/1", Duration::minutes(5)).unwrap().is_some());
        assert_eq!(delete_prefix(&store, "data", "m/").unwrap(), 2);
        assert_eq!(store.len("data"), 1);
        assert!(store.signed_url("data", "m/1", Duration::minutes(5)).unwrap().is_none());
    }
}
