//! In-memory container engine for backend unit tests

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{ContainerEngine, LaunchRequest, SandboxHandle};
use crate::errors::SandboxError;
use crate::logging::{EngineLogger, MemoryLogger};
use crate::types::Runtime;

/// What the engine reports for its registered runtimes.
#[derive(Clone, Copy)]
pub enum Runtimes {
    Installed,
    Missing,
    QueryFails,
}

pub struct FakeEngine {
    pub logger: Arc<MemoryLogger>,
    runtimes: Runtimes,
    reject_runtime: bool,
    /// Runtime requested by each launch, in order.
    pub launches: Mutex<Vec<Option<String>>>,
    pub runtime_queries: AtomicU32,
}

impl FakeEngine {
    pub fn new(runtimes: Runtimes) -> Arc<Self> {
        Arc::new(Self {
            logger: MemoryLogger::new(),
            runtimes,
            reject_runtime: false,
            launches: Mutex::new(Vec::new()),
            runtime_queries: AtomicU32::new(0),
        })
    }

    /// Lists the runtime but refuses containers that ask for it.
    pub fn rejecting_runtime() -> Arc<Self> {
        Arc::new(Self {
            logger: MemoryLogger::new(),
            runtimes: Runtimes::Installed,
            reject_runtime: true,
            launches: Mutex::new(Vec::new()),
            runtime_queries: AtomicU32::new(0),
        })
    }

    pub fn launched_runtimes(&self) -> Vec<Option<String>> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn logger(&self) -> &dyn EngineLogger {
        self.logger.as_ref()
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn runtime_installed(&self, _name: &str) -> Result<bool, SandboxError> {
        self.runtime_queries.fetch_add(1, Ordering::SeqCst);
        match self.runtimes {
            Runtimes::Installed => Ok(true),
            Runtimes::Missing => Ok(false),
            Runtimes::QueryFails => Err(SandboxError::Launch("daemon unreachable".to_string())),
        }
    }

    async fn launch(
        &self,
        request: &LaunchRequest,
        runtime: Option<&str>,
    ) -> Result<SandboxHandle, SandboxError> {
        self.launches
            .lock()
            .unwrap()
            .push(runtime.map(str::to_string));
        match runtime {
            Some(name) if self.reject_runtime => Err(SandboxError::Launch(format!(
                "unknown or invalid runtime name: {}",
                name
            ))),
            _ => Ok(SandboxHandle::new(
                format!("container-{}", request.execution_id),
                request,
            )),
        }
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        handle.cancel.cancel();
        Ok(0)
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.cancel.cancel();
        Ok(())
    }
}

pub fn request() -> LaunchRequest {
    LaunchRequest {
        execution_id: "exec-1".to_string(),
        workspace: PathBuf::from("/tmp/exec-1"),
        image: "python:3.11-alpine".to_string(),
        runtime: Runtime::Python,
        memory_mb: 128,
        cpu_share: 1.0,
        env: BTreeMap::new(),
    }
}
