use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::storage::{validate_uid, ObjectKey, ObjectStore, StorageError, StorageResult};

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";

/// Filesystem-based object store
///
/// Objects live at `<root>/objects/<sop instance uid>/<version>.dcm`. Writes go
/// to a temporary file under `<root>/staging`, are synced, and are then
/// renamed into place.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root_path: PathBuf,
}

impl FilesystemStore {
    /// Create a new store rooted at `root_path`, creating the directory layout
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        for dir in [OBJECTS_DIR, STAGING_DIR] {
            let path = root_path.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(Self { root_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }

    fn object_path(&self, key: &ObjectKey) -> StorageResult<PathBuf> {
        let (uid, version) = key
            .as_str()
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        validate_uid(uid)?;
        if version.is_empty() || !version.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self
            .root_path
            .join(OBJECTS_DIR)
            .join(uid)
            .join(format!("{}.dcm", version)))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    async fn put(&self, sop_instance_uid: &str, data: &[u8]) -> StorageResult<ObjectKey> {
        validate_uid(sop_instance_uid)?;
        let key = ObjectKey::new(sop_instance_uid, &Uuid::new_v4().simple().to_string());
        let target = self.object_path(&key)?;
        let staging = self.root_path.join(STAGING_DIR);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
            let mut staged = tempfile::Builder::new()
                .prefix("put-")
                .suffix(".part")
                .tempfile_in(&staging)
                .map_err(|e| StorageError::io(&staging, e))?;
            staged
                .write_all(&data)
                .and_then(|_| staged.as_file().sync_all())
                .map_err(|e| StorageError::io(staged.path(), e))?;
            staged
                .persist(&target)
                .map_err(|e| StorageError::io(&target, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;

        tracing::debug!(key = %key, "stored object");
        Ok(key)
    }

    async fn get(&self, key: &ObjectKey) -> StorageResult<Bytes> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.clone()))
            }
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn remove(&self, key: &ObjectKey) -> StorageResult<()> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(path, e)),
        }
        // Drop the per-instance directory once its last version is gone
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    async fn exists(&self, key: &ObjectKey) -> bool {
        match self.object_path(key) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}
