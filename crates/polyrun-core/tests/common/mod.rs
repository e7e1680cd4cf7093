//! Shared fixtures for integration tests
//!
//! `HostProcessBackend` runs the generated launcher directly on the host with
//! the local `node`/`python3`, so the whole dispatcher pipeline (harness,
//! workspace, timeout race, artifact parsing) is exercised without a container
//! engine. Tests skip when the interpreter they need is not installed.

#![allow(dead_code)]

use async_trait::async_trait;
use polyrun_core::errors::SandboxError;
use polyrun_core::logging::MemoryLogger;
use polyrun_core::sandbox::telemetry;
use polyrun_core::sandbox::{BackendRegistry, LaunchRequest, SandboxBackend, SandboxHandle};
use polyrun_core::workspace::artifacts;
use polyrun_core::{EngineConfig, ExecutionEngine, ResourceUsage, Runtime, VirtualizationTechnology};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::oneshot;

const KILLED_EXIT_CODE: i64 = 137;

pub struct HostProcessBackend {
    technology: VirtualizationTechnology,
    degraded: Option<String>,
    exits: Mutex<HashMap<String, oneshot::Receiver<i64>>>,
}

impl HostProcessBackend {
    pub fn new(technology: VirtualizationTechnology) -> Self {
        Self {
            technology,
            degraded: None,
            exits: Mutex::new(HashMap::new()),
        }
    }

    /// Behaves like a hardened backend whose runtime is missing.
    pub fn degraded(technology: VirtualizationTechnology, reason: &str) -> Self {
        Self {
            degraded: Some(reason.to_string()),
            ..Self::new(technology)
        }
    }
}

#[async_trait]
impl SandboxBackend for HostProcessBackend {
    fn technology(&self) -> VirtualizationTechnology {
        self.technology
    }

    async fn ensure_image_available(&self, _image: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn launch(&self, request: LaunchRequest) -> Result<SandboxHandle, SandboxError> {
        let mut child = Command::new("sh")
            .arg(request.workspace.join(artifacts::LAUNCHER))
            .current_dir(&request.workspace)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Launch(e.to_string()))?;

        let mut handle = SandboxHandle::new(request.execution_id.clone(), &request);
        if let Some(reason) = &self.degraded {
            handle = handle.degraded(reason.clone());
        }

        let (tx, rx) = oneshot::channel();
        let cancel = handle.cancel.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status
                    .ok()
                    .and_then(|status| status.code())
                    .map(i64::from)
                    .unwrap_or(KILLED_EXIT_CODE),
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    KILLED_EXIT_CODE
                }
            };
            let _ = tx.send(code);
        });

        self.exits.lock().unwrap().insert(handle.id.clone(), rx);
        Ok(handle)
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let rx = self
            .exits
            .lock()
            .unwrap()
            .remove(&handle.id)
            .ok_or_else(|| SandboxError::UnknownHandle {
                id: handle.id.clone(),
            })?;
        rx.await.map_err(|_| SandboxError::WaitInterrupted {
            id: handle.id.clone(),
        })
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.cancel.cancel();
        Ok(())
    }

    async fn collect_stats(&self, handle: &SandboxHandle) -> ResourceUsage {
        let reason = handle
            .degraded
            .clone()
            .unwrap_or_else(|| "host processes are not sampled".to_string());
        telemetry::estimate(handle.runtime, handle.memory_limit_mb, reason)
    }
}

pub fn interpreter_available(runtime: Runtime) -> bool {
    let found = which::which(runtime.interpreter()).is_ok() && which::which("sh").is_ok();
    if !found {
        eprintln!("skipping: '{}' is not installed", runtime.interpreter());
    }
    found
}

pub fn host_engine(root: &Path) -> (ExecutionEngine, Arc<MemoryLogger>) {
    engine_with(root, HostProcessBackend::new(VirtualizationTechnology::Standard))
}

pub fn engine_with(root: &Path, backend: HostProcessBackend) -> (ExecutionEngine, Arc<MemoryLogger>) {
    let logger = MemoryLogger::new();
    let config = EngineConfig {
        workspace_root: root.join("workspaces"),
        ..EngineConfig::default()
    };
    let registry = BackendRegistry::new().with_backend(Arc::new(backend));
    (ExecutionEngine::new(config, registry, logger.clone()), logger)
}

pub fn workspace_count(engine: &ExecutionEngine) -> usize {
    std::fs::read_dir(&engine.config().workspace_root)
        .map(|entries| entries.count())
        .unwrap_or(0)
}
