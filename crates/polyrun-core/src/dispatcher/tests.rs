//! Dispatcher tests against a scripted in-process backend

use super::*;
use crate::errors::SandboxError;
use crate::logging::MemoryLogger;
use crate::sandbox::SandboxHandle;
use crate::types::{ExecutionStatus, Runtime};
use crate::workspace::artifacts;
use async_trait::async_trait;
use log::Level;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Clone)]
enum Script {
    Exit {
        code: i64,
        output: Option<&'static str>,
        logs: Option<&'static str>,
    },
    Hang,
    /// Wait stream breaks and the sandbox cannot be killed afterwards.
    LostSandbox,
    FailImage,
    FailLaunch,
    Panic,
}

struct ScriptedBackend {
    technology: VirtualizationTechnology,
    script: Script,
    launched: Mutex<Vec<LaunchRequest>>,
    terminated: AtomicBool,
}

impl ScriptedBackend {
    fn new(technology: VirtualizationTechnology, script: Script) -> Arc<Self> {
        Arc::new(Self {
            technology,
            script,
            launched: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        })
    }

    fn launches(&self) -> Vec<LaunchRequest> {
        self.launched.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    fn technology(&self) -> VirtualizationTechnology {
        self.technology
    }

    async fn ensure_image_available(&self, image: &str) -> Result<(), SandboxError> {
        match self.script {
            Script::FailImage => Err(SandboxError::ImagePull {
                image: image.to_string(),
                message: "manifest unknown".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn launch(&self, request: LaunchRequest) -> Result<SandboxHandle, SandboxError> {
        self.launched.lock().unwrap().push(request.clone());
        match &self.script {
            Script::FailLaunch => Err(SandboxError::Launch("daemon unreachable".to_string())),
            Script::Panic => panic!("scripted panic"),
            Script::Exit { output, logs, .. } => {
                if let Some(output) = output {
                    std::fs::write(request.workspace.join(artifacts::OUTPUT), output)?;
                }
                if let Some(logs) = logs {
                    std::fs::write(request.workspace.join(artifacts::LOGS), logs)?;
                }
                Ok(SandboxHandle::new(request.execution_id.clone(), &request))
            }
            _ => Ok(SandboxHandle::new(request.execution_id.clone(), &request)),
        }
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        match self.script {
            Script::Exit { code, .. } => Ok(code),
            Script::LostSandbox => Err(SandboxError::WaitInterrupted {
                id: handle.id.clone(),
            }),
            _ => std::future::pending().await,
        }
    }

    async fn terminate(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        handle.cancel.cancel();
        self.terminated.store(true, Ordering::SeqCst);
        match self.script {
            Script::LostSandbox => Err(SandboxError::Terminate {
                id: handle.id.clone(),
                message: "device or resource busy".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn collect_stats(&self, _handle: &SandboxHandle) -> ResourceUsage {
        ResourceUsage::Measured {
            memory_usage_mb: 24.5,
            cpu_usage_percent: 3.0,
        }
    }
}

fn engine(root: &Path, backend: Arc<ScriptedBackend>) -> (ExecutionEngine, Arc<MemoryLogger>) {
    let logger = MemoryLogger::new();
    let config = EngineConfig {
        workspace_root: root.join("workspaces"),
        ..EngineConfig::default()
    };
    let registry = BackendRegistry::new().with_backend(backend);
    (ExecutionEngine::new(config, registry, logger.clone()), logger)
}

fn spec() -> FunctionSpec {
    FunctionSpec::new(
        "hello",
        Runtime::Javascript,
        "exports.handler = async () => ({ statusCode: 200 });",
        "index.handler",
    )
}

fn standard() -> InvocationOptions {
    InvocationOptions::new(VirtualizationTechnology::Standard)
}

fn assert_no_workspaces(engine: &ExecutionEngine) {
    let root = &engine.config().workspace_root;
    if root.exists() {
        assert_eq!(std::fs::read_dir(root).unwrap().count(), 0, "workspace left behind");
    }
}

#[tokio::test]
async fn test_completed_execution_returns_output_and_logs() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        VirtualizationTechnology::Standard,
        Script::Exit {
            code: 0,
            output: Some(r#"{"statusCode":200,"body":{"message":"Hello, World!"}}"#),
            logs: Some("starting\n\nfinished\n"),
        },
    );
    let (engine, _logger) = engine(tmp.path(), backend);

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.error.is_none());
    assert_eq!(
        result.output,
        Some(json!({"statusCode": 200, "body": {"message": "Hello, World!"}}))
    );
    assert_eq!(result.logs, vec!["starting", "finished"]);
    assert!(result.resource_usage.is_measured());
    assert!(result.end_time >= result.start_time);
    assert!(Uuid::parse_str(&result.execution_id).is_ok());
    assert_no_workspaces(&engine);
}

#[tokio::test]
async fn test_handler_error_message_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        VirtualizationTechnology::Standard,
        Script::Exit {
            code: 1,
            output: Some(r#"{"error":"boom"}"#),
            logs: Some("Error: boom\n    at handler (index.js:1:1)"),
        },
    );
    let (engine, _logger) = engine(tmp.path(), backend);

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("boom"));
    assert!(result.output.is_none());
    assert_eq!(result.logs.len(), 2);
    assert_no_workspaces(&engine);
}

#[tokio::test]
async fn test_nonzero_exit_without_output_names_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        VirtualizationTechnology::Standard,
        Script::Exit {
            code: 137,
            output: None,
            logs: None,
        },
    );
    let (engine, _logger) = engine(tmp.path(), backend);

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    assert_eq!(
        result.error.as_deref(),
        Some("Function execution failed with exit code 137")
    );
    assert!(result.logs.is_empty());
}

#[tokio::test]
async fn test_clean_exit_without_output_completes_with_placeholder() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        VirtualizationTechnology::Standard,
        Script::Exit {
            code: 0,
            output: None,
            logs: None,
        },
    );
    let (engine, logger) = engine(tmp.path(), backend);

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    assert!(result.is_completed());
    assert_eq!(result.output, Some(json!({ "message": NO_OUTPUT_MESSAGE })));
    assert!(logger.contains(Level::Warn, "without writing an output artifact"));
}

#[tokio::test]
async fn test_timeout_terminates_sandbox_and_releases_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(VirtualizationTechnology::Standard, Script::Hang);
    let (engine, _logger) = engine(tmp.path(), backend.clone());

    let started = std::time::Instant::now();
    let result = engine
        .execute(&spec(), &json!({}), &standard().with_timeout_seconds(1))
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("Function execution timed out after 1 seconds")
    );
    assert!(backend.terminated.load(Ordering::SeqCst));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert_no_workspaces(&engine);
}

#[tokio::test]
async fn test_launch_failure_is_infrastructure_error() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(VirtualizationTechnology::Standard, Script::FailLaunch);
    let (engine, _logger) = engine(tmp.path(), backend);

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    let error = result.error.clone().unwrap();
    assert!(error.contains("daemon unreachable"));
    assert_eq!(result.logs, vec![error]);
    assert_eq!(result.resource_usage, ResourceUsage::Unavailable);
    assert_no_workspaces(&engine);
}

#[tokio::test]
async fn test_image_failure_names_image() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(VirtualizationTechnology::Standard, Script::FailImage);
    let (engine, _logger) = engine(tmp.path(), backend.clone());

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    let error = result.error.unwrap();
    assert!(error.contains("node:18-alpine"));
    assert!(error.contains("manifest unknown"));
    assert!(backend.launches().is_empty());
    assert_no_workspaces(&engine);
}

#[tokio::test]
async fn test_panic_inside_invocation_becomes_failed_result() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(VirtualizationTechnology::Standard, Script::Panic);
    let (engine, _logger) = engine(tmp.path(), backend);

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("Internal error: scripted panic"));
    assert_no_workspaces(&engine);
}

#[tokio::test]
async fn test_unknown_technology_rejected_before_workspace() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        VirtualizationTechnology::Standard,
        Script::Exit {
            code: 0,
            output: Some("1"),
            logs: None,
        },
    );
    let (engine, _logger) = engine(tmp.path(), backend.clone());

    let options = InvocationOptions::new(VirtualizationTechnology::Hardened);
    let result = engine.execute(&spec(), &json!({}), &options).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("Virtualization technology 'hardened' is not supported")
    );
    assert_eq!(result.resource_usage, ResourceUsage::Unavailable);
    assert!(backend.launches().is_empty());
    assert!(!engine.config().workspace_root.exists());
}

#[tokio::test]
async fn test_out_of_range_limits_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(VirtualizationTechnology::Standard, Script::Hang);
    let (engine, _logger) = engine(tmp.path(), backend.clone());

    let result = engine
        .execute(&spec(), &json!({}), &standard().with_memory_mb(4096))
        .await;
    assert!(result.error.unwrap().contains("4096MB"));

    let result = engine
        .execute(&spec().with_timeout_seconds(0), &json!({}), &standard())
        .await;
    assert!(result.error.unwrap().contains("Timeout 0s"));

    assert!(backend.launches().is_empty());
    assert!(engine.plan(&spec(), &standard().with_timeout_seconds(301)).is_err());
}

#[tokio::test]
async fn test_launch_request_carries_limits_and_context() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(
        VirtualizationTechnology::Standard,
        Script::Exit {
            code: 0,
            output: Some("null"),
            logs: None,
        },
    );
    let (engine, _logger) = engine(tmp.path(), backend.clone());
    let spec = spec()
        .with_id("fn-42")
        .with_memory_mb(256)
        .with_env("API_URL", "http://example.com");

    let result = engine
        .execute(&spec, &json!({}), &standard().with_timeout_seconds(9))
        .await;
    assert_eq!(result.output, Some(Value::Null));

    let launches = backend.launches();
    assert_eq!(launches.len(), 1);
    let request = &launches[0];
    assert_eq!(request.execution_id, result.execution_id);
    assert_eq!(request.memory_mb, 256);
    assert_eq!(request.image, "node:18-alpine");
    assert_eq!(request.cpu_share, 1.0);
    assert!(request.workspace.ends_with(&result.execution_id));
    assert_eq!(request.env["API_URL"], "http://example.com");
    assert_eq!(request.env[context_env::EXECUTION_ID], result.execution_id);
    assert_eq!(request.env[context_env::FUNCTION_ID], "fn-42");
    assert_eq!(request.env[context_env::TIMEOUT_SECONDS], "9");
    assert_eq!(request.env[context_env::MEMORY_LIMIT_MB], "256");
    assert!(request.env[context_env::DEADLINE_MS].parse::<i64>().unwrap() > 0);
}

#[test]
fn test_interpret_malformed_output_on_clean_exit() {
    let limits = EffectiveLimits {
        timeout_seconds: 30,
        memory_mb: 128,
    };
    let interpretation = interpret(
        Ok(WaitOutcome::Exited(0)),
        OutputArtifact::Malformed("EOF while parsing".to_string()),
        vec!["line".to_string()],
        &limits,
    );
    assert_eq!(
        interpretation.verdict,
        Verdict::Completed(json!({ "message": NO_OUTPUT_MESSAGE }))
    );
    assert_eq!(interpretation.logs, vec!["line"]);
    assert_eq!(interpretation.warnings.len(), 1);
}

#[test]
fn test_interpret_failed_termination_keeps_timeout_verdict() {
    let limits = EffectiveLimits {
        timeout_seconds: 5,
        memory_mb: 128,
    };
    let interpretation = interpret(
        Ok(WaitOutcome::TimedOut {
            terminate_error: Some("no such container".to_string()),
        }),
        OutputArtifact::Missing,
        Vec::new(),
        &limits,
    );
    assert_eq!(
        interpretation.verdict,
        Verdict::Failed("Function execution timed out after 5 seconds".to_string())
    );
    assert!(interpretation.warnings[0].contains("no such container"));
}

#[test]
fn test_interpret_ignores_non_string_error_field() {
    let limits = EffectiveLimits {
        timeout_seconds: 5,
        memory_mb: 128,
    };
    let interpretation = interpret(
        Ok(WaitOutcome::Exited(1)),
        OutputArtifact::Present(json!({"error": {"code": 7}})),
        Vec::new(),
        &limits,
    );
    assert_eq!(
        interpretation.verdict,
        Verdict::Failed("Function execution failed with exit code 1".to_string())
    );
}

#[tokio::test]
async fn test_failed_cleanup_after_wait_error_is_logged() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(VirtualizationTechnology::Standard, Script::LostSandbox);
    let (engine, logger) = engine(tmp.path(), backend.clone());

    let result = engine.execute(&spec(), &json!({}), &standard()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("ended unexpectedly"));
    assert!(backend.terminated.load(Ordering::SeqCst));
    assert!(logger.contains(Level::Warn, "may still be running"));
    assert!(logger.contains(Level::Warn, "device or resource busy"));
    assert_no_workspaces(&engine);
}
