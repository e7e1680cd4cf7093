//! Configuration type definitions for the execution engine
//!
//! Every section carries defaults, so an empty YAML document is a valid
//! configuration. Values that must hold for the engine to work are checked in
//! [`EngineConfig::validate`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::EngineError;
use crate::types::Runtime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            docker: DockerConfig::default(),
            images: ImageConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Low-level runtime requested by the hardened backend.
    #[serde(default = "default_hardened_runtime")]
    pub hardened_runtime: String,
    /// Explicit runtime for the standard backend; `None` uses the daemon default.
    #[serde(default)]
    pub standard_runtime: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            hardened_runtime: default_hardened_runtime(),
            standard_runtime: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_javascript_image")]
    pub javascript: String,
    #[serde(default = "default_python_image")]
    pub python: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            javascript: default_javascript_image(),
            python: default_python_image(),
        }
    }
}

impl ImageConfig {
    pub fn for_runtime(&self, runtime: Runtime) -> &str {
        match runtime {
            Runtime::Javascript => &self.javascript,
            Runtime::Python => &self.python,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// CPU quota in logical cores. Capped at one core.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    #[serde(default)]
    pub network_disabled: bool,
    #[serde(default = "default_no_new_privileges")]
    pub no_new_privileges: bool,
    /// `uid:gid` the sandbox process runs as; the image default when unset.
    #[serde(default)]
    pub container_user: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu_cores: default_cpu_cores(),
            pids_limit: default_pids_limit(),
            network_disabled: false,
            no_new_privileges: default_no_new_privileges(),
            container_user: None,
        }
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("polyrun-workspaces")
}

fn default_hardened_runtime() -> String {
    "runsc".to_string()
}

fn default_javascript_image() -> String {
    "node:18-alpine".to_string()
}

fn default_python_image() -> String {
    "python:3.11-alpine".to_string()
}

fn default_cpu_cores() -> f64 {
    1.0
}

fn default_pids_limit() -> i64 {
    128
}

fn default_no_new_privileges() -> bool {
    true
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.workspace_root.is_absolute() {
            return Err(EngineError::Config(format!(
                "Workspace root '{}' must be an absolute path",
                self.workspace_root.display()
            )));
        }

        if self.images.javascript.trim().is_empty() || self.images.python.trim().is_empty() {
            return Err(EngineError::Config(
                "Runtime images cannot be empty".to_string(),
            ));
        }

        if self.docker.hardened_runtime.trim().is_empty() {
            return Err(EngineError::Config(
                "Hardened runtime name cannot be empty".to_string(),
            ));
        }

        if !(self.sandbox.cpu_cores > 0.0 && self.sandbox.cpu_cores <= 1.0) {
            return Err(EngineError::Config(format!(
                "cpu_cores must be greater than 0 and at most 1, got {}",
                self.sandbox.cpu_cores
            )));
        }

        if self.sandbox.pids_limit <= 0 {
            return Err(EngineError::Config(format!(
                "pids_limit must be positive, got {}",
                self.sandbox.pids_limit
            )));
        }

        Ok(())
    }
}
