//! Data model shared between the engine and its callers
//!
//! `FunctionSpec` and `InvocationOptions` come in from the persistence layer,
//! `ExecutionResult` goes back out. Everything in between is engine-internal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::EngineError;

pub const MIN_TIMEOUT_SECONDS: u32 = 1;
pub const MAX_TIMEOUT_SECONDS: u32 = 300;
pub const MIN_MEMORY_MB: u32 = 64;
pub const MAX_MEMORY_MB: u32 = 1024;

/// Prefix reserved for variables the engine injects into every sandbox.
pub const RESERVED_ENV_PREFIX: &str = "POLYRUN_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    #[serde(alias = "node", alias = "nodejs")]
    Javascript,
    #[serde(alias = "python3")]
    Python,
}

impl Runtime {
    /// Stem of the entry file, which is also the leading handler segment.
    pub fn entry_stem(&self) -> &'static str {
        match self {
            Runtime::Javascript => "index",
            Runtime::Python => "main",
        }
    }

    pub fn source_file(&self) -> &'static str {
        match self {
            Runtime::Javascript => "index.js",
            Runtime::Python => "main.py",
        }
    }

    pub fn harness_file(&self) -> &'static str {
        match self {
            Runtime::Javascript => "harness.js",
            Runtime::Python => "harness.py",
        }
    }

    pub fn interpreter(&self) -> &'static str {
        match self {
            Runtime::Javascript => "node",
            Runtime::Python => "python3",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Javascript => "javascript",
            Runtime::Python => "python",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "javascript" | "node" | "nodejs" => Ok(Runtime::Javascript),
            "python" | "python3" => Ok(Runtime::Python),
            other => Err(EngineError::Validation(format!(
                "Unsupported runtime '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VirtualizationTechnology {
    #[default]
    #[serde(alias = "docker")]
    Standard,
    #[serde(alias = "gvisor")]
    Hardened,
}

impl VirtualizationTechnology {
    pub fn as_str(&self) -> &'static str {
        match self {
            VirtualizationTechnology::Standard => "standard",
            VirtualizationTechnology::Hardened => "hardened",
        }
    }
}

impl fmt::Display for VirtualizationTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VirtualizationTechnology {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "docker" => Ok(VirtualizationTechnology::Standard),
            "hardened" | "gvisor" => Ok(VirtualizationTechnology::Hardened),
            other => Err(EngineError::UnsupportedTechnology(other.to_string())),
        }
    }
}

/// A stored function definition. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub runtime: Runtime,
    pub code: String,
    #[serde(default = "default_handler")]
    pub handler: String,
    #[serde(default = "default_timeout_seconds", alias = "timeout")]
    pub timeout_seconds: u32,
    #[serde(default = "default_memory_mb", alias = "memorySize")]
    pub memory_mb: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_handler() -> String {
    "index.handler".to_string()
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_memory_mb() -> u32 {
    128
}

impl FunctionSpec {
    pub fn new(
        name: impl Into<String>,
        runtime: Runtime,
        code: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            runtime,
            code: code.into(),
            handler: handler.into(),
            timeout_seconds: default_timeout_seconds(),
            memory_mb: default_memory_mb(),
            environment: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Check the stored limits and environment against the accepted ranges.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "Function name cannot be empty".to_string(),
            ));
        }
        check_timeout(self.timeout_seconds)?;
        check_memory(self.memory_mb)?;
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(EngineError::Validation(format!(
                    "Invalid environment variable name '{}'",
                    key
                )));
            }
            if key.to_uppercase().starts_with(RESERVED_ENV_PREFIX) {
                return Err(EngineError::Validation(format!(
                    "Environment variable '{}' uses the reserved {} prefix",
                    key, RESERVED_ENV_PREFIX
                )));
            }
        }
        Ok(())
    }
}

/// Per-call overrides. Unset limits fall back to the function's own values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationOptions {
    #[serde(default)]
    pub virtualization_technology: VirtualizationTechnology,
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: Option<u32>,
    #[serde(default, alias = "memorySize")]
    pub memory_mb: Option<u32>,
}

impl InvocationOptions {
    pub fn new(technology: VirtualizationTechnology) -> Self {
        Self {
            virtualization_technology: technology,
            ..Default::default()
        }
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }
}

/// Limits actually applied to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub timeout_seconds: u32,
    pub memory_mb: u32,
}

impl EffectiveLimits {
    /// Explicit options win over the function's defaults; both must lie in range.
    pub fn resolve(spec: &FunctionSpec, options: &InvocationOptions) -> Result<Self, EngineError> {
        let timeout_seconds = options.timeout_seconds.unwrap_or(spec.timeout_seconds);
        let memory_mb = options.memory_mb.unwrap_or(spec.memory_mb);
        check_timeout(timeout_seconds)?;
        check_memory(memory_mb)?;
        Ok(Self {
            timeout_seconds,
            memory_mb,
        })
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.timeout_seconds))
    }
}

fn check_timeout(timeout_seconds: u32) -> Result<(), EngineError> {
    if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(EngineError::Validation(format!(
            "Timeout {}s is outside the allowed range {}-{}s",
            timeout_seconds, MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS
        )));
    }
    Ok(())
}

fn check_memory(memory_mb: u32) -> Result<(), EngineError> {
    if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&memory_mb) {
        return Err(EngineError::Validation(format!(
            "Memory {}MB is outside the allowed range {}-{}MB",
            memory_mb, MIN_MEMORY_MB, MAX_MEMORY_MB
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
}

/// Resource accounting for one invocation, tagged with where the numbers came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum ResourceUsage {
    /// Sampled from the sandbox engine while the sandbox ran.
    #[serde(rename_all = "camelCase")]
    Measured {
        memory_usage_mb: f64,
        cpu_usage_percent: f64,
    },
    /// Synthetic placeholder produced in degraded mode.
    #[serde(rename_all = "camelCase")]
    Estimated {
        memory_usage_mb: f64,
        cpu_usage_percent: f64,
        reason: String,
    },
    /// No sandbox ran, so there is nothing to report.
    Unavailable,
}

impl ResourceUsage {
    pub fn memory_usage_mb(&self) -> f64 {
        match self {
            ResourceUsage::Measured { memory_usage_mb, .. }
            | ResourceUsage::Estimated { memory_usage_mb, .. } => *memory_usage_mb,
            ResourceUsage::Unavailable => 0.0,
        }
    }

    pub fn cpu_usage_percent(&self) -> f64 {
        match self {
            ResourceUsage::Measured {
                cpu_usage_percent, ..
            }
            | ResourceUsage::Estimated {
                cpu_usage_percent, ..
            } => *cpu_usage_percent,
            ResourceUsage::Unavailable => 0.0,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, ResourceUsage::Measured { .. })
    }
}

/// Terminal outcome of one invocation.
///
/// Built only through [`ExecutionResult::completed`] and
/// [`ExecutionResult::failed`], which keep `status` and `error` in step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub output: Option<Value>,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub resource_usage: ResourceUsage,
}

impl ExecutionResult {
    pub fn completed(
        execution_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        output: Value,
        logs: Vec<String>,
        resource_usage: ResourceUsage,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: ExecutionStatus::Completed,
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            output: Some(output),
            logs,
            error: None,
            resource_usage,
        }
    }

    pub fn failed(
        execution_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        error: impl Into<String>,
        logs: Vec<String>,
        resource_usage: ResourceUsage,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: ExecutionStatus::Failed,
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds(),
            output: None,
            logs,
            error: Some(error.into()),
            resource_usage,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn memory_usage_mb(&self) -> f64 {
        self.resource_usage.memory_usage_mb()
    }

    pub fn cpu_usage_percent(&self) -> f64 {
        self.resource_usage.cpu_usage_percent()
    }
}
