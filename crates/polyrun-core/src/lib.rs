//! Sandboxed execution engine for user-submitted functions.
//!
//! The engine takes a stored function definition (source code, runtime,
//! handler path and resource limits), runs it once inside an isolated sandbox
//! against an input payload and returns a structured result carrying output,
//! captured log lines, timing and resource usage.
//!
//! # Architecture Overview
//!
//! - **Dispatcher**: validates a request, drives one invocation end to end and
//!   folds every failure into an `ExecutionResult`
//! - **Harness generation**: per-runtime shims that load user code, resolve the
//!   dotted handler path and record output and logs
//! - **Workspaces**: one scratch directory per invocation, removed on every path
//! - **Sandbox backends**: a standard container runtime and a hardened runtime
//!   that degrades to the standard one when it is not installed
//! - **Configuration**: YAML with environment overrides

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod harness;
pub mod logging;
pub mod sandbox;
pub mod types;
pub mod workspace;

pub use config::{ConfigLoader, EngineConfig};
pub use dispatcher::{ExecutionEngine, ExecutionPlan};
pub use errors::{EngineError, SandboxError};
pub use logging::{EngineLogger, LogFacade, MemoryLogger};
pub use sandbox::{BackendRegistry, SandboxBackend};
pub use types::*;
