use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod filesystem;

pub use filesystem::FilesystemStore;

/// Error type for object store operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Location of one stored version of an instance
///
/// Every `put` yields a fresh key, so an index entry and the bytes it points
/// at never change underneath a reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub(crate) fn new(sop_instance_uid: &str, version: &str) -> Self {
        Self(format!("{}/{}", sop_instance_uid, version))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SOP Instance UID the key was created for
    pub fn sop_instance_uid(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable storage of raw data sets keyed by SOP Instance UID
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Durably write a data set; the returned key is visible only once this returns
    async fn put(&self, sop_instance_uid: &str, data: &[u8]) -> StorageResult<ObjectKey>;

    /// Read back the exact bytes written by `put`
    async fn get(&self, key: &ObjectKey) -> StorageResult<Bytes>;

    async fn remove(&self, key: &ObjectKey) -> StorageResult<()>;

    async fn exists(&self, key: &ObjectKey) -> bool;
}

/// UIDs are used as path components, so only the UID alphabet is allowed
pub fn validate_uid(uid: &str) -> StorageResult<()> {
    let valid = !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(uid.to_string()))
    }
}
