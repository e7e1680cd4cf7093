//! Per-invocation scratch directories
//!
//! Every invocation gets its own directory under the configured root, named
//! after the execution id. The directory is backed by a [`TempDir`], so it is
//! removed exactly once: explicitly through [`Workspace::release`] on the
//! normal path, or by `Drop` if the invocation unwinds before reaching it.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{Builder, TempDir};
use tokio::fs;

use crate::errors::EngineError;
use crate::harness::HarnessSource;
use crate::logging::{component, EngineLogger};
use crate::types::Runtime;

/// Fixed artifact names inside a workspace.
pub mod artifacts {
    pub const INPUT: &str = "input.json";
    pub const OUTPUT: &str = "output.json";
    pub const LOGS: &str = "logs.txt";
    pub const LAUNCHER: &str = "run.sh";
}

/// What the harness left in the output artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputArtifact {
    Missing,
    Malformed(String),
    Present(Value),
}

pub struct WorkspaceManager {
    root: PathBuf,
    logger: Arc<dyn EngineLogger>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, logger: Arc<dyn EngineLogger>) -> Self {
        Self {
            root: root.into(),
            logger,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory for one execution.
    pub async fn allocate(&self, execution_id: &str) -> Result<Workspace, EngineError> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to create workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let dir = Builder::new()
            .prefix(execution_id)
            .rand_bytes(0)
            .tempdir_in(&self.root)
            .map_err(|e| {
                EngineError::Workspace(format!(
                    "Failed to create workspace for {}: {}",
                    execution_id, e
                ))
            })?;

        // The sandbox process may run as an unprivileged user and must be able
        // to write its output and log artifacts back.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o777))
                .await
                .map_err(|e| {
                    EngineError::Workspace(format!(
                        "Failed to open up workspace permissions for {}: {}",
                        execution_id, e
                    ))
                })?;
        }

        self.logger.debug(
            component::WORKSPACE,
            &format!("Allocated workspace {}", dir.path().display()),
        );

        Ok(Workspace {
            dir,
            execution_id: execution_id.to_string(),
            logger: self.logger.clone(),
        })
    }
}

pub struct Workspace {
    dir: TempDir,
    execution_id: String,
    logger: Arc<dyn EngineLogger>,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Write source, input, harness and launcher for `runtime`.
    pub async fn materialize(
        &self,
        runtime: Runtime,
        code: &str,
        input: &Value,
        harness: &HarnessSource,
        launcher: &str,
    ) -> Result<(), EngineError> {
        let input = serde_json::to_string(input).map_err(|e| {
            EngineError::Validation(format!("Input payload is not serializable: {}", e))
        })?;

        self.write(runtime.source_file(), code).await?;
        self.write(artifacts::INPUT, &input).await?;
        self.write(harness.file_name, &harness.source).await?;
        self.write(artifacts::LAUNCHER, launcher).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(
                self.path().join(artifacts::LAUNCHER),
                std::fs::Permissions::from_mode(0o755),
            )
            .await
            .map_err(|e| self.io_error(artifacts::LAUNCHER, e))?;
        }

        Ok(())
    }

    pub async fn read_output(&self) -> OutputArtifact {
        let path = self.path().join(artifacts::OUTPUT);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return OutputArtifact::Missing,
        };
        if content.trim().is_empty() {
            return OutputArtifact::Missing;
        }
        match serde_json::from_str(&content) {
            Ok(value) => OutputArtifact::Present(value),
            Err(e) => OutputArtifact::Malformed(e.to_string()),
        }
    }

    /// Captured log lines, blank lines dropped. A missing artifact yields none.
    pub async fn read_logs(&self) -> Vec<String> {
        match fs::read_to_string(self.path().join(artifacts::LOGS)).await {
            Ok(content) => content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove the directory and everything in it.
    pub fn release(self) -> Result<(), EngineError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to remove workspace {}: {}",
                path.display(),
                e
            ))
        })?;
        self.logger.debug(
            component::WORKSPACE,
            &format!("Released workspace {}", path.display()),
        );
        Ok(())
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), EngineError> {
        fs::write(self.path().join(name), content)
            .await
            .map_err(|e| self.io_error(name, e))
    }

    fn io_error(&self, name: &str, err: std::io::Error) -> EngineError {
        EngineError::Workspace(format!(
            "Failed to write {} for {}: {}",
            name, self.execution_id, err
        ))
    }
}
