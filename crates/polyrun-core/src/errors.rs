//! Error types for the execution engine
//!
//! Failures are grouped by where they originate: caller input that is rejected
//! before any sandbox resource is touched, the sandbox engine itself, and the
//! per-invocation workspace. The dispatcher folds every variant into a failed
//! `ExecutionResult`, so these types never cross the public `execute` boundary.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Virtualization technology '{0}' is not supported")]
    UnsupportedTechnology(String),
    #[error("Workspace error: {0}")]
    Workspace(String),
    #[error("Failed to prepare image '{image}': {message}")]
    Image { image: String, message: String },
    #[error("Sandbox error: {0}")]
    Sandbox(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the error was raised before any sandbox resource was touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_) | EngineError::UnsupportedTechnology(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::ImagePull { image, message } => EngineError::Image { image, message },
            other => EngineError::Sandbox(other.to_string()),
        }
    }
}

// Errors raised by sandbox backends
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Failed to pull image '{image}': {message}")]
    ImagePull { image: String, message: String },
    #[error("Failed to launch sandbox: {0}")]
    Launch(String),
    #[error("Sandbox '{id}' is not known to this backend")]
    UnknownHandle { id: String },
    #[error("Sandbox wait stream for '{id}' ended unexpectedly")]
    WaitInterrupted { id: String },
    #[error("Failed to terminate sandbox '{id}': {message}")]
    Terminate { id: String, message: String },
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
}
