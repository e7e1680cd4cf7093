//! Configuration loader for YAML files and environment overrides
//!
//! Loading always runs the same three steps: parse, apply `POLYRUN_*`
//! environment overrides, validate.

use crate::config::types::EngineConfig;
use crate::errors::EngineError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const ENV_WORKSPACE_ROOT: &str = "POLYRUN_WORKSPACE_ROOT";
pub const ENV_HARDENED_RUNTIME: &str = "POLYRUN_HARDENED_RUNTIME";
pub const ENV_IMAGE_JAVASCRIPT: &str = "POLYRUN_IMAGE_JAVASCRIPT";
pub const ENV_IMAGE_PYTHON: &str = "POLYRUN_IMAGE_PYTHON";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, EngineError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<EngineConfig, EngineError> {
        let mut config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| EngineError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Defaults plus environment overrides, for callers without a config file
    pub fn from_env() -> Result<EngineConfig, EngineError> {
        let mut config = EngineConfig::default();
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(config: &mut EngineConfig) {
        if let Some(root) = non_empty_var(ENV_WORKSPACE_ROOT) {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(runtime) = non_empty_var(ENV_HARDENED_RUNTIME) {
            config.docker.hardened_runtime = runtime;
        }
        if let Some(image) = non_empty_var(ENV_IMAGE_JAVASCRIPT) {
            config.images.javascript = image;
        }
        if let Some(image) = non_empty_var(ENV_IMAGE_PYTHON) {
            config.images.python = image;
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
