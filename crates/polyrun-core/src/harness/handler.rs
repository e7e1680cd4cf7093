//! Dotted handler references (`index.handler`, `main.api.handle`)

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::errors::EngineError;
use crate::types::Runtime;

/// A validated handler reference.
///
/// The leading segment names the entry file and is skipped by the harness
/// resolver; the remaining segments are walked through the module's exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerPath {
    raw: String,
    segments: Vec<String>,
}

impl HandlerPath {
    pub fn parse(runtime: Runtime, handler: &str) -> Result<Self, EngineError> {
        let raw = handler.trim();
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();

        if segments.len() < 2 {
            return Err(EngineError::Validation(format!(
                "Handler '{}' must have the form '{}.<method>'",
                raw,
                runtime.entry_stem()
            )));
        }

        if segments[0] != runtime.entry_stem() {
            return Err(EngineError::Validation(format!(
                "Handler '{}' must start with the entry file '{}' for the {} runtime",
                raw,
                runtime.entry_stem(),
                runtime
            )));
        }

        let pattern = identifier_pattern(runtime);
        if let Some(bad) = segments.iter().find(|segment| !pattern.is_match(segment)) {
            return Err(EngineError::Validation(format!(
                "Handler '{}' contains an invalid segment '{}'",
                raw, bad
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

}

impl fmt::Display for HandlerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn identifier_pattern(runtime: Runtime) -> &'static Regex {
    static JAVASCRIPT: OnceLock<Regex> = OnceLock::new();
    static PYTHON: OnceLock<Regex> = OnceLock::new();
    match runtime {
        Runtime::Javascript => JAVASCRIPT.get_or_init(|| {
            Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("static identifier pattern")
        }),
        Runtime::Python => PYTHON.get_or_init(|| {
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier pattern")
        }),
    }
}
