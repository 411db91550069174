//! Content store boundary.
//!
//! Blobs are addressed by an opaque (bucket, key) pair. The pipeline only
//! reads; the ingestion coordinator is the single writer.

use std::path::PathBuf;

use bytes::Bytes;
use tracing::debug;

use crate::error::StorageError;

/// Filesystem-backed content store rooted at the service data directory.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }

    /// Store a blob, creating the bucket directory on first use.
    pub fn put(&self, bucket: &str, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: e,
            })?;
        }
        std::fs::write(&path, content).map_err(|e| StorageError::Io {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: e,
        })?;
        debug!(bucket = %bucket, key = %key, bytes = content.len(), "Stored object");
        Ok(())
    }

    /// Fetch a blob by its opaque locator.
    pub fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StorageError> {
        let path = self.object_path(bucket, key);
        if !path.exists() {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        std::fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| StorageError::Io {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: e,
            })
    }
}
