mod archive_config;
mod logging_config;
mod tests;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use dimse::{DimseConfig, DimseError, RemoteNode};
use serde::Deserialize;
use thiserror::Error;

pub use archive_config::{ArchiveConfig, DuplicatePolicy};
pub use logging_config::LoggingConfig;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [dimse] section: {0}")]
    Dimse(#[from] DimseError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Compact peer list, `AET@host:port;AET@host:port`
    #[serde(default)]
    pub remotes: String,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub dimse: DimseConfig,

    /// `[[remote]]` tables
    #[serde(default, rename = "remote")]
    pub remote_nodes: Vec<RemoteNode>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&text)?;
        config.archive.resolve_relative_to(path.parent().unwrap_or_else(|| Path::new(".")));
        config.validate()?;
        Ok(config)
    }

    /// Every configured peer: `[[remote]]` tables first, then the compact list
    pub fn peers(&self) -> Result<Vec<RemoteNode>> {
        let mut nodes = self.remote_nodes.clone();
        nodes.extend(RemoteNode::parse_list(&self.remotes)?);
        Ok(nodes)
    }

    pub fn validate(&self) -> Result<()> {
        self.dimse.validate()?;
        self.archive.validate()?;
        self.logging.validate()?;

        let mut seen = HashSet::new();
        for node in self.peers()? {
            node.validate()?;
            if !seen.insert(node.ae_title.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "remote AE title '{}' configured more than once",
                    node.ae_title
                )));
            }
        }
        Ok(())
    }
}
