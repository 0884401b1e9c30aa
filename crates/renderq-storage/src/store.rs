//! Object storage seam.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};

/// Minimal object storage surface the uploader needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`.
    async fn put_object(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
        content_length: Option<u64>,
    ) -> StorageResult<()>;

    /// Mint a time-limited GET URL for `key`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String>;
}

/// A stored object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub content_length: Option<u64>,
}

/// In-memory object store. Presigned URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    fail_uploads: bool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every upload fails.
    pub fn failing() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            fail_uploads: true,
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    /// Resolve a URL minted by [`ObjectStore::presign_get`].
    pub async fn get_presigned(&self, url: &str) -> StorageResult<StoredObject> {
        let key = url
            .strip_prefix("memory://")
            .and_then(|rest| rest.split('?').next())
            .ok_or_else(|| StorageError::InvalidKey(url.to_string()))?;
        self.get(key)
            .await
            .ok_or_else(|| StorageError::not_found(key))
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        body: ByteStream,
        content_type: &str,
        content_length: Option<u64>,
    ) -> StorageResult<()> {
        if self.fail_uploads {
            return Err(StorageError::upload_failed("memory store rejects uploads"));
        }
        let bytes = body
            .collect()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?
            .into_bytes()
            .to_vec();

        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                content_length,
            },
        );
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        if !self.objects.read().await.contains_key(key) {
            return Err(StorageError::not_found(key));
        }
        Ok(format!("memory://{}?expires={}", key, expires_in.as_secs()))
    }
}
