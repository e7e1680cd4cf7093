//! Hardened-runtime backend
//!
//! Runs the same containers as the standard backend but asks the daemon for an
//! alternate low-level runtime (gVisor's `runsc` by default). When that runtime
//! is not installed the invocation still runs, on the default runtime, and the
//! handle is marked degraded so the result carries estimated usage and a
//! warning is logged.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::standard::collect_container_stats;
use super::{ContainerEngine, LaunchRequest, SandboxBackend, SandboxHandle};
use crate::errors::SandboxError;
use crate::logging::component;
use crate::types::{ResourceUsage, VirtualizationTechnology};

/// Which runtime a launch will actually use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeSelection {
    Hardened(String),
    Fallback { reason: String },
}

pub fn select_runtime(installed: bool, runtime: &str) -> RuntimeSelection {
    if installed {
        RuntimeSelection::Hardened(runtime.to_string())
    } else {
        RuntimeSelection::Fallback {
            reason: format!(
                "hardened runtime '{}' is not installed, running on the standard runtime",
                runtime
            ),
        }
    }
}

pub struct HardenedBackend {
    engine: Arc<dyn ContainerEngine>,
    runtime: String,
    installed: OnceCell<bool>,
}

impl HardenedBackend {
    pub fn new(engine: Arc<dyn ContainerEngine>, runtime: impl Into<String>) -> Self {
        Self {
            engine,
            runtime: runtime.into(),
            installed: OnceCell::new(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Checks the daemon once; a failed check is retried on the next call.
    pub async fn runtime_available(&self) -> Result<bool, SandboxError> {
        self.installed
            .get_or_try_init(|| self.engine.runtime_installed(&self.runtime))
            .await
            .copied()
    }

    async fn launch_fallback(
        &self,
        request: &LaunchRequest,
        reason: String,
    ) -> Result<SandboxHandle, SandboxError> {
        self.engine
            .logger()
            .warn(component::HARDENED, &format!("{}: {}", request.execution_id, reason));
        let handle = self.engine.launch(request, None).await?;
        Ok(handle.degraded(reason))
    }
}

#[async_trait]
impl SandboxBackend for HardenedBackend {
    fn technology(&self) -> VirtualizationTechnology {
        VirtualizationTechnology::Hardened
    }

    async fn ensure_image_available(&self, image: &str) -> Result<(), SandboxError> {
        self.engine.ensure_image(image).await
    }

    async fn launch(&self, request: LaunchRequest) -> Result<SandboxHandle, SandboxError> {
        let installed = match self.runtime_available().await {
            Ok(installed) => installed,
            Err(e) => {
                self.engine.logger().warn(
                    component::HARDENED,
                    &format!("Could not query installed runtimes: {}", e),
                );
                false
            }
        };

        match select_runtime(installed, &self.runtime) {
            RuntimeSelection::Hardened(runtime) => {
                match self.engine.launch(&request, Some(&runtime)).await {
                    Ok(handle) => Ok(handle),
                    // Registered but unusable, e.g. removed since the check.
                    Err(e) if mentions_runtime(&e, &runtime) => {
                        let reason = format!(
                            "hardened runtime '{}' was rejected by the daemon ({}), running on the standard runtime",
                            runtime, e
                        );
                        self.launch_fallback(&request, reason).await
                    }
                    Err(e) => Err(e),
                }
            }
            RuntimeSelection::Fallback { reason } => self.launch_fallback(&request, reason).await,
        }
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        self.engine.wait_exit(handle).await
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.engine.terminate(handle).await
    }

    async fn collect_stats(&self, handle: &SandboxHandle) -> ResourceUsage {
        collect_container_stats(self.engine.as_ref(), handle, component::HARDENED)
    }
}

fn mentions_runtime(error: &SandboxError, runtime: &str) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("runtime") && message.contains(&runtime.to_lowercase())
}
