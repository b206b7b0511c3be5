use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::config::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_file_path")]
    pub log_file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_to_file: false,
            log_file_path: default_log_file_path(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        EnvFilter::try_new(&self.level)
            .map_err(|e| ConfigError::Invalid(format!("logging.level '{}': {}", self.level, e)))?;
        if self.log_to_file && self.log_file_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "logging.log_file_path is required when log_to_file is set".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_log_file_path() -> String {
    "mupacs.log".to_string()
}
