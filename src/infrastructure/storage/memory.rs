use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{ObjectStream, Storage, StorageError, StoredObject};

/// Process-local storage. Used for tests and for running without object storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.read().get(path).cloned()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Bytes>) {
        self.objects.write().insert(path.into(), bytes.into());
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), StorageError> {
        self.objects.write().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, bytes)| StoredObject {
                name: name.clone(),
                size: bytes.len() as u64,
                is_directory: false,
            })
            .collect())
    }

    async fn download(&self, path: &str) -> Result<ObjectStream, StorageError> {
        let bytes = self
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(Box::pin(futures_util::stream::once(async move { Ok(bytes) })))
    }

    async fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.objects.write().remove(path);
        Ok(())
    }
}
