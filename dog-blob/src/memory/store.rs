use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;

use crate::store::{validate_key, validate_owner, ContentKeyStrategy, DefaultKeyStrategy, PutOptions};
use crate::{BlobId, BlobResult, ByteStream, ContentStore};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone)]
struct StoredObject {
    bytes: Bytes,
    media_type: Option<String>,
}

/// In-memory content store for testing and development
pub struct MemoryContentStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    keys: Arc<dyn ContentKeyStrategy>,
    chunk_size: usize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            keys: Arc::new(DefaultKeyStrategy),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn ContentKeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    /// Size of the chunks content is streamed back in
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Number of stored objects across all owners.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn media_type(&self, owner_id: &str, id: &BlobId) -> Option<String> {
        let key = self.keys.object_key(owner_id, id);
        self.objects.read().get(&key).and_then(|o| o.media_type.clone())
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn exists(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool> {
        validate_key(owner_id, id)?;
        let key = self.keys.object_key(owner_id, id);
        Ok(self.objects.read().contains_key(&key))
    }

    async fn put(
        &self,
        owner_id: &str,
        id: &BlobId,
        mut stream: ByteStream,
        options: PutOptions,
    ) -> BlobResult<()> {
        validate_key(owner_id, id)?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        let key = self.keys.object_key(owner_id, id);
        self.objects.write().insert(
            key,
            StoredObject {
                bytes: buffer.freeze(),
                media_type: options.media_type,
            },
        );
        Ok(())
    }

    async fn get(&self, owner_id: &str, id: &BlobId) -> BlobResult<Option<ByteStream>> {
        validate_key(owner_id, id)?;
        let key = self.keys.object_key(owner_id, id);
        let Some(object) = self.objects.read().get(&key).cloned() else {
            return Ok(None);
        };

        let chunk_size = self.chunk_size;
        let stream = async_stream::stream! {
            let mut offset = 0;
            while offset < object.bytes.len() {
                let end = (offset + chunk_size).min(object.bytes.len());
                yield Ok::<Bytes, std::io::Error>(object.bytes.slice(offset..end));
                offset = end;
            }
        };
        Ok(Some(Box::pin(stream)))
    }

    async fn delete(&self, owner_id: &str, id: &BlobId) -> BlobResult<bool> {
        validate_key(owner_id, id)?;
        let key = self.keys.object_key(owner_id, id);
        Ok(self.objects.write().remove(&key).is_some())
    }

    async fn delete_all(&self, owner_id: &str) -> BlobResult<()> {
        validate_owner(owner_id)?;
        let prefix = self.keys.owner_prefix(owner_id);
        self.objects.write().retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}
