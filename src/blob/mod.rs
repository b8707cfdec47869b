//! Blob store collaborator.
//!
//! Step bodies and job payload data live outside the hub in a simple
//! key-value blob store (`step/<id>`, `step-data/<id>`). The hub only
//! needs get/set/delete by key; the filesystem implementation here maps
//! keys to files under a base directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Errors that can occur during blob operations.
#[derive(Debug, Error)]
pub enum BlobError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key contains path components that would escape the store.
    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    /// Storage directory creation failed.
    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),
}

/// Key prefix for serialized step bodies.
pub const STEP_KEY_PREFIX: &str = "step";
/// Key prefix for job input/output payload data.
pub const STEP_DATA_KEY_PREFIX: &str = "step-data";

/// Returns the blob key for a step's serialized body.
pub fn step_key(id: &str) -> String {
    format!("{STEP_KEY_PREFIX}/{id}")
}

/// Returns the blob key for a step's payload data.
pub fn step_data_key(id: &str) -> String {
    format!("{STEP_DATA_KEY_PREFIX}/{id}")
}

/// Per-key atomic get/set/delete over binary blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Reads the blob at `key`, or None when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError>;

    /// Writes the blob at `key`, replacing any existing value.
    async fn set(&self, key: &str, data: &[u8]) -> Result<(), BlobError>;

    /// Deletes the blob at `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;
}

/// Filesystem-backed blob store.
///
/// Keys map to files under the base directory; the `/` separator in keys
/// becomes a subdirectory, so `step/<id>` and `step-data/<id>` land in
/// their own trees.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    /// Creates a blob store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolves a key to its file path, rejecting traversal components.
    fn key_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        if key.is_empty()
            || key.split('/').any(|part| {
                part.is_empty() || part == "." || part == ".." || part.contains('\\')
            })
        {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(e)),
        }
    }

    async fn set(&self, key: &str, data: &[u8]) -> Result<(), BlobError> {
        let path = self.key_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                BlobError::DirectoryCreationFailed(format!(
                    "Failed to create directory {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}
