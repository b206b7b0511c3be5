use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::ConfigError;

/// What a store of an already archived SOP Instance UID does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep the archived instance and fail the store
    #[default]
    Reject,
    /// Replace the archived instance
    Overwrite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Defaults to `index.redb` inside `storage_dir`
    #[serde(default)]
    pub index_path: Option<PathBuf>,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Query keys the archive has no value for match anyway
    #[serde(default = "default_match_absent")]
    pub match_absent_attributes: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            index_path: None,
            duplicate_policy: DuplicatePolicy::default(),
            match_absent_attributes: default_match_absent(),
        }
    }
}

impl ArchiveConfig {
    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("index.redb"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "archive.storage_dir cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Relative paths are resolved against the directory of the config file
    pub(crate) fn resolve_relative_to(&mut self, base: &Path) {
        if self.storage_dir.is_relative() {
            self.storage_dir = base.join(&self.storage_dir);
        }
        if let Some(index_path) = self.index_path.as_mut() {
            if index_path.is_relative() {
                *index_path = base.join(&*index_path);
            }
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./archive")
}

fn default_match_absent() -> bool {
    true
}
