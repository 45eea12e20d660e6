//! Durable storage contract: upload, list, download, remove.
//!
//! Back ends live behind the [`Storage`] trait so the watcher, verifier and
//! manifest code never see whether bytes end up in S3/MinIO or in memory.

pub mod memory;
pub mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use thiserror::Error;

pub use memory::MemoryStorage;
pub use s3::StorageService;

pub type ObjectStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
}

impl StoredObject {
    /// Last path component of the object name.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn upload(&self, path: &str, bytes: Bytes) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, StorageError>;

    async fn download(&self, path: &str) -> Result<ObjectStream, StorageError>;

    async fn remove(&self, path: &str) -> Result<(), StorageError>;

    async fn download_bytes(&self, path: &str) -> Result<Bytes, StorageError> {
        let mut stream = self.download(path).await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(self.list(path).await?.iter().any(|o| o.name == path))
    }
}

/// Storage key for a file belonging to an asset: `{asset_id}/{file_name}`.
pub fn object_key(asset_id: &str, file_name: &str) -> String {
    format!("{asset_id}/{file_name}")
}

/// Content type sent along with uploads.
pub fn content_type_for(file_name: &str) -> String {
    if file_name.ends_with(".m3u8") {
        return "application/vnd.apple.mpegurl".to_string();
    }
    if file_name.ends_with(".ts") {
        return "video/mp2t".to_string();
    }
    mime_guess::from_path(file_name)
        .first()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM)
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("a.1000k.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("a.1000k.000.ts"), "video/mp2t");
        assert_eq!(content_type_for("a.sub_en.000.vtt"), "text/vtt");
        assert_eq!(content_type_for("blob"), mime::APPLICATION_OCTET_STREAM.essence_str());
    }

    #[test]
    fn file_name_of_nested_object() {
        let object = StoredObject {
            name: "a1/a1.1000k.000.ts".into(),
            size: 10,
            is_directory: false,
        };
        assert_eq!(object.file_name(), "a1.1000k.000.ts");
    }
}
