//! Standard-runtime backend: plain containers on the daemon's default runtime

use async_trait::async_trait;
use std::sync::Arc;

use super::telemetry;
use super::{ContainerEngine, LaunchRequest, SandboxBackend, SandboxHandle};
use crate::errors::SandboxError;
use crate::logging::component;
use crate::types::{ResourceUsage, VirtualizationTechnology};

pub struct StandardBackend {
    engine: Arc<dyn ContainerEngine>,
    runtime: Option<String>,
}

impl StandardBackend {
    /// `runtime` pins an explicit low-level runtime; `None` uses the daemon default.
    pub fn new(engine: Arc<dyn ContainerEngine>, runtime: Option<String>) -> Self {
        Self { engine, runtime }
    }
}

#[async_trait]
impl SandboxBackend for StandardBackend {
    fn technology(&self) -> VirtualizationTechnology {
        VirtualizationTechnology::Standard
    }

    async fn ensure_image_available(&self, image: &str) -> Result<(), SandboxError> {
        self.engine.ensure_image(image).await
    }

    async fn launch(&self, request: LaunchRequest) -> Result<SandboxHandle, SandboxError> {
        self.engine.launch(&request, self.runtime.as_deref()).await
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        self.engine.wait_exit(handle).await
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.engine.terminate(handle).await
    }

    async fn collect_stats(&self, handle: &SandboxHandle) -> ResourceUsage {
        collect_container_stats(self.engine.as_ref(), handle, component::STANDARD)
    }
}

/// Measured peaks when the sampler saw the container, an estimate otherwise.
pub(crate) fn collect_container_stats(
    engine: &dyn ContainerEngine,
    handle: &SandboxHandle,
    component: &'static str,
) -> ResourceUsage {
    handle.cancel.cancel();

    if let Some(reason) = &handle.degraded {
        let reason = format!("{}; resource usage is estimated", reason);
        engine.logger().warn(component, &format!("Sandbox {}: {}", handle.id, reason));
        return telemetry::estimate(handle.runtime, handle.memory_limit_mb, reason);
    }

    match handle.telemetry.measured() {
        Some(usage) => usage,
        None => {
            let reason = "no telemetry samples were collected before the sandbox exited";
            engine.logger().warn(component, &format!("Sandbox {}: {}", handle.id, reason));
            telemetry::estimate(handle.runtime, handle.memory_limit_mb, reason)
        }
    }
}
