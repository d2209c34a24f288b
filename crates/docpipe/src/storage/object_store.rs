//! Object storage with bucket notifications
//!
//! The pipeline observes storage through object-created / object-removed
//! notifications per bucket, optionally narrowed by a key-suffix filter.
//! Staged copies and result artifacts use deterministic keys so retried
//! writes overwrite instead of fanning out duplicate work.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{ObjectEvent, ObjectEventKind};

/// Object tag key carrying the document id across stages
pub const DOCUMENT_ID_TAG: &str = "documentId";

/// Bucket/key-addressed object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object; an existing object under the same key is replaced
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        tags: HashMap<String, String>,
        writer: &str,
    ) -> Result<()>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Copy an object between buckets, preserving its tags
    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
        writer: &str,
    ) -> Result<()>;

    /// Attach or replace a single tag on an existing object
    async fn tag(&self, bucket: &str, key: &str, tag_key: &str, value: &str) -> Result<()>;

    async fn get_tags(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>>;

    async fn remove(&self, bucket: &str, key: &str, writer: &str) -> Result<()>;

    /// Subscribe to object notifications for one bucket. `suffix` narrows
    /// delivery to keys ending with the given string.
    fn subscribe(&self, bucket: &str, suffix: Option<String>) -> mpsc::UnboundedReceiver<ObjectEvent>;

    /// Provider name for logging
    fn name(&self) -> &str;
}

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    tags: HashMap<String, String>,
}

struct BucketSubscription {
    bucket: String,
    suffix: Option<String>,
    sender: mpsc::UnboundedSender<ObjectEvent>,
}

/// In-memory object store
pub struct MemoryObjectStore {
    objects: DashMap<(String, String), StoredObject>,
    subscriptions: Mutex<Vec<BucketSubscription>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, event: ObjectEvent) {
        let mut subs = self.subscriptions.lock();
        subs.retain(|sub| {
            if sub.bucket != event.bucket {
                return true;
            }
            if let Some(suffix) = &sub.suffix {
                if !event.key.ends_with(suffix.as_str()) {
                    return true;
                }
            }
            // Prune subscriptions whose receiver is gone
            sub.sender.send(event.clone()).is_ok()
        });
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        tags: HashMap<String, String>,
        writer: &str,
    ) -> Result<()> {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { data, tags },
        );
        self.notify(ObjectEvent {
            bucket: bucket.to_string(),
            key: key.to_string(),
            kind: ObjectEventKind::Created,
            writer: writer.to_string(),
            version: None,
        });
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
        writer: &str,
    ) -> Result<()> {
        let object = self
            .objects
            .get(&(source_bucket.to_string(), source_key.to_string()))
            .map(|o| o.clone())
            .ok_or_else(|| Error::ObjectNotFound {
                bucket: source_bucket.to_string(),
                key: source_key.to_string(),
            })?;
        self.objects
            .insert((target_bucket.to_string(), target_key.to_string()), object);
        self.notify(ObjectEvent {
            bucket: target_bucket.to_string(),
            key: target_key.to_string(),
            kind: ObjectEventKind::Copied,
            writer: writer.to_string(),
            version: None,
        });
        Ok(())
    }

    async fn tag(&self, bucket: &str, key: &str, tag_key: &str, value: &str) -> Result<()> {
        let mut object = self
            .objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| Error::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        object.tags.insert(tag_key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_tags(&self, bucket: &str, key: &str) -> Result<HashMap<String, String>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.tags.clone())
            .ok_or_else(|| Error::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn remove(&self, bucket: &str, key: &str, writer: &str) -> Result<()> {
        self.objects
            .remove(&(bucket.to_string(), key.to_string()));
        self.notify(ObjectEvent {
            bucket: bucket.to_string(),
            key: key.to_string(),
            kind: ObjectEventKind::Removed,
            writer: writer.to_string(),
            version: None,
        });
        Ok(())
    }

    fn subscribe(&self, bucket: &str, suffix: Option<String>) -> mpsc::UnboundedReceiver<ObjectEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscriptions.lock().push(BucketSubscription {
            bucket: bucket.to_string(),
            suffix,
            sender,
        });
        receiver
    }

    fn name(&self) -> &str {
        "memory-object-store"
    }
}
