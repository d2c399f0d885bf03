//! Configuration loading.
//!
//! 1. Load `.env` if present (via dotenvy)
//! 2. Read TOML from `BATCH_QUEUE_CONFIG_PATH` (or an explicit path)
//! 3. Substitute `${VAR}` references from the environment
//! 4. Deserialize and validate

use super::BatchQueueConfig;
use crate::errors::{ConfigResult, ConfigurationError};
use std::path::Path;
use tracing::debug;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "BATCH_QUEUE_CONFIG_PATH";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `BATCH_QUEUE_CONFIG_PATH`.
    ///
    /// When the variable is unset, the built-in defaults are returned so
    /// development setups work without any file on disk.
    pub fn load_from_env() -> ConfigResult<BatchQueueConfig> {
        dotenvy::dotenv().ok();

        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_path(&path),
            Err(_) => {
                debug!("{CONFIG_PATH_ENV} not set, using default configuration");
                let config = BatchQueueConfig::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Load and validate configuration from an explicit TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<BatchQueueConfig> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigurationError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::parse(&contents)
    }

    /// Parse TOML contents, substituting `${VAR}` from the environment.
    pub fn parse(contents: &str) -> ConfigResult<BatchQueueConfig> {
        let substituted = substitute_env_vars(contents);
        let config: BatchQueueConfig =
            toml::from_str(&substituted).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Replace `${VAR}` occurrences with the environment value, leaving
/// unresolvable references untouched.
fn substitute_env_vars(contents: &str) -> String {
    let mut result = String::with_capacity(contents.len());
    let mut rest = contents;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str(&rest[start..start + end + 3]);
                    }
                }
                rest = &rest[start + end + 3..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
