//! Sandbox backends
//!
//! A backend knows how to start one isolated process tree against a prepared
//! workspace, wait for it, kill it and report what it consumed. The dispatcher
//! only ever talks to the [`SandboxBackend`] trait and looks backends up in a
//! [`BackendRegistry`] keyed by virtualization technology.

pub mod docker;
pub mod hardened;
pub mod standard;
pub mod telemetry;
#[cfg(test)]
mod testing;

pub use docker::DockerEngine;
pub use hardened::HardenedBackend;
pub use standard::StandardBackend;
pub use telemetry::TelemetryRecorder;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::SandboxError;
use crate::logging::EngineLogger;
use crate::types::{ResourceUsage, Runtime, VirtualizationTechnology};

/// Everything a backend needs to start a sandbox for one invocation.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub execution_id: String,
    /// Host directory mounted read-write as the sandbox working directory.
    pub workspace: PathBuf,
    pub image: String,
    pub runtime: Runtime,
    pub memory_mb: u32,
    /// Fraction of one logical core, in (0, 1].
    pub cpu_share: f64,
    pub env: BTreeMap<String, String>,
}

/// A started sandbox.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub runtime: Runtime,
    pub memory_limit_mb: u32,
    /// Set when the sandbox runs with weaker isolation than requested.
    pub degraded: Option<String>,
    /// Cancelled once the sandbox is finished or killed; stops samplers.
    pub cancel: CancellationToken,
    pub telemetry: Arc<TelemetryRecorder>,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, request: &LaunchRequest) -> Self {
        Self {
            id: id.into(),
            runtime: request.runtime,
            memory_limit_mb: request.memory_mb,
            degraded: None,
            cancel: CancellationToken::new(),
            telemetry: Arc::new(TelemetryRecorder::new()),
        }
    }

    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.degraded = Some(reason.into());
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i64),
    /// The timer fired first and the sandbox was killed. A failed kill is
    /// reported here rather than as an error so the caller still sees the
    /// timeout.
    TimedOut { terminate_error: Option<String> },
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn technology(&self) -> VirtualizationTechnology;

    /// Make sure `image` is present locally, pulling it on a miss.
    async fn ensure_image_available(&self, image: &str) -> Result<(), SandboxError>;

    async fn launch(&self, request: LaunchRequest) -> Result<SandboxHandle, SandboxError>;

    /// Block until the sandbox exits on its own and return its exit code.
    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError>;

    /// Kill the sandbox. Safe to call on a sandbox that already exited.
    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Best-effort usage report. Never fails; degraded numbers are tagged.
    async fn collect_stats(&self, handle: &SandboxHandle) -> ResourceUsage;

    /// Race natural completion against `timeout`, killing the sandbox if the
    /// timer wins.
    async fn wait_with_timeout(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
    ) -> Result<WaitOutcome, SandboxError> {
        tokio::select! {
            exited = self.wait_exit(handle) => exited.map(WaitOutcome::Exited),
            _ = tokio::time::sleep(timeout) => {
                handle.cancel.cancel();
                let terminate_error = self.terminate(handle).await.err().map(|e| e.to_string());
                Ok(WaitOutcome::TimedOut { terminate_error })
            }
        }
    }
}

/// Container operations shared by the docker-backed variants.
///
/// [`DockerEngine`] is the production implementation; the standard and
/// hardened backends only differ in which low-level runtime they pass to
/// `launch`.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn logger(&self) -> &dyn EngineLogger;

    /// Pull `image` unless it is already in the local cache.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError>;

    /// Whether the engine has a low-level runtime registered under `name`.
    async fn runtime_installed(&self, name: &str) -> Result<bool, SandboxError>;

    /// Create and start a container; `None` uses the engine's default runtime.
    async fn launch(
        &self,
        request: &LaunchRequest,
        runtime: Option<&str>,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Wait for the container to exit, then remove it.
    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError>;

    /// Force-remove the container, killing it if it still runs.
    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Backends available to the dispatcher, one per technology.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<VirtualizationTechnology, Arc<dyn SandboxBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn SandboxBackend>) {
        self.backends.insert(backend.technology(), backend);
    }

    pub fn with_backend(mut self, backend: Arc<dyn SandboxBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, technology: VirtualizationTechnology) -> Option<Arc<dyn SandboxBackend>> {
        self.backends.get(&technology).cloned()
    }

    pub fn technologies(&self) -> Vec<VirtualizationTechnology> {
        let mut technologies: Vec<_> = self.backends.keys().copied().collect();
        technologies.sort_by_key(|technology| technology.as_str());
        technologies
    }
}
