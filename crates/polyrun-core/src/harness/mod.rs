//! Harness generation for sandboxed function invocations
//!
//! A harness is a small program written next to the user's source file. Inside
//! the sandbox it reads the input artifact, loads the user module, walks the
//! dotted handler path to the target callable and invokes it with the payload
//! and an execution context. Everything written to stdout/stderr during the
//! run is recorded line by line in the log artifact, and the handler's return
//! value (or `{"error": message}`) lands in the output artifact.
//!
//! Exit codes are shared by all runtimes:
//!
//! | code | meaning                                           |
//! |------|---------------------------------------------------|
//! | 0    | handler returned, output written                  |
//! | 1    | handler raised or rejected                        |
//! | 2    | harness could not load input, module or handler   |

mod handler;
mod javascript;
mod python;

pub use handler::HandlerPath;

use crate::types::Runtime;
use crate::workspace::artifacts;

pub const EXIT_OK: i64 = 0;
pub const EXIT_HANDLER_ERROR: i64 = 1;
pub const EXIT_HARNESS_ERROR: i64 = 2;

/// Environment variables the harness reads to build the execution context.
pub mod context_env {
    pub const EXECUTION_ID: &str = "POLYRUN_EXECUTION_ID";
    pub const FUNCTION_ID: &str = "POLYRUN_FUNCTION_ID";
    pub const FUNCTION_NAME: &str = "POLYRUN_FUNCTION_NAME";
    pub const MEMORY_LIMIT_MB: &str = "POLYRUN_MEMORY_LIMIT_MB";
    pub const TIMEOUT_SECONDS: &str = "POLYRUN_TIMEOUT_SECONDS";
    pub const DEADLINE_MS: &str = "POLYRUN_DEADLINE_MS";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessSource {
    pub file_name: &'static str,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HarnessGenerator;

impl HarnessGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, runtime: Runtime, handler: &HandlerPath) -> HarnessSource {
        let template = match runtime {
            Runtime::Javascript => javascript::TEMPLATE,
            Runtime::Python => python::TEMPLATE,
        };

        let source = template
            .replace("{{HANDLER_SEGMENTS}}", &literal_list(handler.segments()))
            .replace("{{ENTRY_SEGMENT}}", &literal(runtime.entry_stem()))
            .replace("{{SOURCE_FILE}}", &literal(runtime.source_file()))
            .replace("{{INPUT_FILE}}", &literal(artifacts::INPUT))
            .replace("{{OUTPUT_FILE}}", &literal(artifacts::OUTPUT))
            .replace("{{LOG_FILE}}", &literal(artifacts::LOGS))
            .replace("{{EXIT_OK}}", &EXIT_OK.to_string())
            .replace("{{EXIT_HANDLER_ERROR}}", &EXIT_HANDLER_ERROR.to_string())
            .replace("{{EXIT_HARNESS_ERROR}}", &EXIT_HARNESS_ERROR.to_string());

        HarnessSource {
            file_name: runtime.harness_file(),
            source,
        }
    }

    /// Shell launcher the sandbox runs as its command.
    pub fn launcher(&self, runtime: Runtime) -> String {
        format!(
            "#!/bin/sh\ncd \"$(dirname \"$0\")\" || exit {}\nexec {} {}\n",
            EXIT_HARNESS_ERROR,
            runtime.interpreter(),
            runtime.harness_file()
        )
    }
}

// JSON string and array literals are valid in both target languages.
fn literal(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn literal_list(values: &[String]) -> String {
    serde_json::Value::from(values.to_vec()).to_string()
}
