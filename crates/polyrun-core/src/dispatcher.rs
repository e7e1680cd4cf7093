//! Execution dispatcher
//!
//! [`ExecutionEngine::execute`] is the single entry point of the engine. It
//! validates the request, allocates a workspace, writes the harness, runs the
//! sandbox against the timeout, reads the artifacts back and always releases
//! the workspace. Every path, including a panic inside the invocation, ends in
//! a well-formed [`ExecutionResult`].

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::harness::{context_env, HandlerPath, HarnessGenerator, EXIT_OK};
use crate::logging::{component, EngineLogger};
use crate::sandbox::{
    BackendRegistry, ContainerEngine, DockerEngine, HardenedBackend, LaunchRequest,
    SandboxBackend, StandardBackend, WaitOutcome,
};
use crate::types::{
    EffectiveLimits, ExecutionResult, FunctionSpec, InvocationOptions, ResourceUsage,
    VirtualizationTechnology,
};
use crate::workspace::{OutputArtifact, Workspace, WorkspaceManager};

/// Output recorded for a successful run that left no usable output artifact.
pub const NO_OUTPUT_MESSAGE: &str = "Function execution did not produce output";

/// A validated invocation: the backend, limits and handler it will run with.
pub struct ExecutionPlan {
    pub technology: VirtualizationTechnology,
    pub limits: EffectiveLimits,
    pub handler: HandlerPath,
    pub image: String,
    backend: Arc<dyn SandboxBackend>,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    backends: BackendRegistry,
    workspaces: WorkspaceManager,
    harness: HarnessGenerator,
    logger: Arc<dyn EngineLogger>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        backends: BackendRegistry,
        logger: Arc<dyn EngineLogger>,
    ) -> Self {
        let workspaces = WorkspaceManager::new(config.workspace_root.clone(), logger.clone());
        Self {
            config,
            backends,
            workspaces,
            harness: HarnessGenerator::new(),
            logger,
        }
    }

    /// Engine with both docker-backed variants sharing one daemon client.
    pub fn connect(config: EngineConfig, logger: Arc<dyn EngineLogger>) -> Result<Self, EngineError> {
        config.validate()?;
        let docker: Arc<dyn ContainerEngine> =
            Arc::new(DockerEngine::connect(config.sandbox.clone(), logger.clone())?);
        let backends = BackendRegistry::new()
            .with_backend(Arc::new(StandardBackend::new(
                docker.clone(),
                config.docker.standard_runtime.clone(),
            )))
            .with_backend(Arc::new(HardenedBackend::new(
                docker,
                config.docker.hardened_runtime.clone(),
            )));
        Ok(Self::new(config, backends, logger))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Validate a request without touching any sandbox resource.
    pub fn plan(
        &self,
        spec: &FunctionSpec,
        options: &InvocationOptions,
    ) -> Result<ExecutionPlan, EngineError> {
        let technology = options.virtualization_technology;
        let backend = self
            .backends
            .get(technology)
            .ok_or_else(|| EngineError::UnsupportedTechnology(technology.to_string()))?;

        spec.validate()?;
        let limits = EffectiveLimits::resolve(spec, options)?;
        let handler = HandlerPath::parse(spec.runtime, &spec.handler)?;

        Ok(ExecutionPlan {
            technology,
            limits,
            handler,
            image: self.config.images.for_runtime(spec.runtime).to_string(),
            backend,
        })
    }

    pub async fn execute(
        &self,
        spec: &FunctionSpec,
        input: &Value,
        options: &InvocationOptions,
    ) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let start_time = Utc::now();

        let plan = match self.plan(spec, options) {
            Ok(plan) => plan,
            Err(e) => {
                self.logger.warn(
                    component::DISPATCHER,
                    &format!("Execution {} rejected: {}", execution_id, e),
                );
                let message = e.to_string();
                return ExecutionResult::failed(
                    execution_id,
                    start_time,
                    Utc::now(),
                    message.clone(),
                    vec![message],
                    ResourceUsage::Unavailable,
                );
            }
        };

        self.logger.info(
            component::DISPATCHER,
            &format!(
                "Execution {} started: function '{}' ({}) on {} backend, timeout {}s, memory {}MB",
                execution_id,
                spec.name,
                spec.runtime,
                plan.technology,
                plan.limits.timeout_seconds,
                plan.limits.memory_mb
            ),
        );

        let invocation = AssertUnwindSafe(self.invoke(&execution_id, spec, input, &plan))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = EngineError::Internal(panic_message(panic.as_ref())).to_string();
                Invocation {
                    verdict: Verdict::Failed(message.clone()),
                    logs: vec![message],
                    usage: ResourceUsage::Unavailable,
                }
            });
        let end_time = Utc::now();

        let result = match invocation.verdict {
            Verdict::Completed(output) => ExecutionResult::completed(
                execution_id,
                start_time,
                end_time,
                output,
                invocation.logs,
                invocation.usage,
            ),
            Verdict::Failed(error) => ExecutionResult::failed(
                execution_id,
                start_time,
                end_time,
                error,
                invocation.logs,
                invocation.usage,
            ),
        };

        match &result.error {
            None => self.logger.info(
                component::DISPATCHER,
                &format!(
                    "Execution {} completed in {}ms",
                    result.execution_id, result.duration_ms
                ),
            ),
            Some(error) => self.logger.error(
                component::DISPATCHER,
                &format!(
                    "Execution {} failed after {}ms: {}",
                    result.execution_id, result.duration_ms, error
                ),
            ),
        }

        result
    }

    async fn invoke(
        &self,
        execution_id: &str,
        spec: &FunctionSpec,
        input: &Value,
        plan: &ExecutionPlan,
    ) -> Invocation {
        let workspace = match self.workspaces.allocate(execution_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                let interpretation = interpret(Err(e), OutputArtifact::Missing, Vec::new(), &plan.limits);
                return Invocation::from_interpretation(interpretation, ResourceUsage::Unavailable);
            }
        };

        let run = self.run_sandbox(&workspace, execution_id, spec, input, plan).await;
        let logs = workspace.read_logs().await;
        let output = workspace.read_output().await;

        if let Err(e) = workspace.release() {
            self.logger.warn(component::DISPATCHER, &e.to_string());
        }

        let interpretation = interpret(run.outcome, output, logs, &plan.limits);
        for warning in &interpretation.warnings {
            self.logger.warn(
                component::DISPATCHER,
                &format!("Execution {}: {}", execution_id, warning),
            );
        }
        Invocation::from_interpretation(interpretation, run.usage)
    }

    async fn run_sandbox(
        &self,
        workspace: &Workspace,
        execution_id: &str,
        spec: &FunctionSpec,
        input: &Value,
        plan: &ExecutionPlan,
    ) -> SandboxRun {
        let harness = self.harness.generate(spec.runtime, &plan.handler);
        let launcher = self.harness.launcher(spec.runtime);
        if let Err(e) = workspace
            .materialize(spec.runtime, &spec.code, input, &harness, &launcher)
            .await
        {
            return SandboxRun::failed(e);
        }

        if let Err(e) = plan.backend.ensure_image_available(&plan.image).await {
            return SandboxRun::failed(e.into());
        }

        let request = LaunchRequest {
            execution_id: execution_id.to_string(),
            workspace: workspace.path().to_path_buf(),
            image: plan.image.clone(),
            runtime: spec.runtime,
            memory_mb: plan.limits.memory_mb,
            cpu_share: self.config.sandbox.cpu_cores,
            env: sandbox_env(execution_id, spec, &plan.limits),
        };

        let handle = match plan.backend.launch(request).await {
            Ok(handle) => handle,
            Err(e) => return SandboxRun::failed(e.into()),
        };

        let outcome = plan
            .backend
            .wait_with_timeout(&handle, plan.limits.timeout())
            .await
            .map_err(EngineError::from);

        if outcome.is_err() {
            if let Err(e) = plan.backend.terminate(&handle).await {
                self.logger.warn(
                    component::DISPATCHER,
                    &format!(
                        "Execution {}: sandbox {} may still be running: {}",
                        execution_id, handle.id, e
                    ),
                );
            }
        }

        let usage = plan.backend.collect_stats(&handle).await;
        SandboxRun { outcome, usage }
    }
}

/// User environment plus the context variables the harness reads.
fn sandbox_env(
    execution_id: &str,
    spec: &FunctionSpec,
    limits: &EffectiveLimits,
) -> BTreeMap<String, String> {
    let deadline_ms = Utc::now().timestamp_millis() + i64::from(limits.timeout_seconds) * 1000;

    let mut env = spec.environment.clone();
    env.insert(context_env::EXECUTION_ID.to_string(), execution_id.to_string());
    env.insert(context_env::FUNCTION_ID.to_string(), spec.id.clone());
    env.insert(context_env::FUNCTION_NAME.to_string(), spec.name.clone());
    env.insert(
        context_env::MEMORY_LIMIT_MB.to_string(),
        limits.memory_mb.to_string(),
    );
    env.insert(
        context_env::TIMEOUT_SECONDS.to_string(),
        limits.timeout_seconds.to_string(),
    );
    env.insert(context_env::DEADLINE_MS.to_string(), deadline_ms.to_string());
    env
}

struct SandboxRun {
    outcome: Result<WaitOutcome, EngineError>,
    usage: ResourceUsage,
}

impl SandboxRun {
    fn failed(error: EngineError) -> Self {
        Self {
            outcome: Err(error),
            usage: ResourceUsage::Unavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Completed(Value),
    Failed(String),
}

struct Invocation {
    verdict: Verdict,
    logs: Vec<String>,
    usage: ResourceUsage,
}

impl Invocation {
    fn from_interpretation(interpretation: Interpretation, usage: ResourceUsage) -> Self {
        Self {
            verdict: interpretation.verdict,
            logs: interpretation.logs,
            usage,
        }
    }
}

#[derive(Debug)]
struct Interpretation {
    verdict: Verdict,
    logs: Vec<String>,
    warnings: Vec<String>,
}

/// Map the sandbox outcome and the artifacts it left into a verdict.
fn interpret(
    outcome: Result<WaitOutcome, EngineError>,
    output: OutputArtifact,
    mut logs: Vec<String>,
    limits: &EffectiveLimits,
) -> Interpretation {
    let mut warnings = Vec::new();

    let verdict = match outcome {
        Ok(WaitOutcome::Exited(EXIT_OK)) => match output {
            OutputArtifact::Present(value) => Verdict::Completed(value),
            OutputArtifact::Missing => {
                warnings.push("exited cleanly without writing an output artifact".to_string());
                Verdict::Completed(json!({ "message": NO_OUTPUT_MESSAGE }))
            }
            OutputArtifact::Malformed(reason) => {
                warnings.push(format!("output artifact is not valid JSON: {}", reason));
                Verdict::Completed(json!({ "message": NO_OUTPUT_MESSAGE }))
            }
        },
        Ok(WaitOutcome::Exited(code)) => {
            let reported = match &output {
                OutputArtifact::Present(value) => value
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|message| !message.is_empty())
                    .map(str::to_string),
                _ => None,
            };
            Verdict::Failed(reported.unwrap_or_else(|| {
                format!("Function execution failed with exit code {}", code)
            }))
        }
        Ok(WaitOutcome::TimedOut { terminate_error }) => {
            if let Some(e) = terminate_error {
                warnings.push(format!("sandbox could not be terminated after timeout: {}", e));
            }
            Verdict::Failed(format!(
                "Function execution timed out after {} seconds",
                limits.timeout_seconds
            ))
        }
        Err(e) => {
            let message = e.to_string();
            logs.push(message.clone());
            Verdict::Failed(message)
        }
    };

    Interpretation {
        verdict,
        logs,
        warnings,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "invocation panicked".to_string()
    }
}

#[cfg(test)]
mod tests;
