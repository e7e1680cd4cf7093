//! Function manifests: a FunctionSpec on disk, in YAML or JSON
//!
//! Besides the inline `code` field a manifest may point at a source file with
//! `codeFile`, resolved relative to the manifest's own directory.

use anyhow::{anyhow, Context, Result};
use polyrun_core::FunctionSpec;
use serde_yaml::Value;
use std::path::Path;

const CODE_KEY: &str = "code";
const CODE_FILE_KEY: &str = "codeFile";

pub async fn load_function(path: &Path) -> Result<FunctionSpec> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read function manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_function(&content, base).await
}

pub async fn parse_function(content: &str, base: &Path) -> Result<FunctionSpec> {
    let mut document: Value =
        serde_yaml::from_str(content).context("Failed to parse function manifest")?;

    let mapping = document
        .as_mapping_mut()
        .ok_or_else(|| anyhow!("Function manifest must be a mapping"))?;

    if let Some(code_file) = mapping.remove(CODE_FILE_KEY) {
        if mapping.contains_key(CODE_KEY) {
            return Err(anyhow!(
                "Function manifest sets both '{}' and '{}'",
                CODE_KEY,
                CODE_FILE_KEY
            ));
        }
        let relative = code_file
            .as_str()
            .ok_or_else(|| anyhow!("'{}' must be a string", CODE_FILE_KEY))?;
        let source_path = base.join(relative);
        let code = tokio::fs::read_to_string(&source_path)
            .await
            .with_context(|| format!("Failed to read function source {}", source_path.display()))?;
        mapping.insert(Value::from(CODE_KEY), Value::from(code));
    }

    serde_yaml::from_value(document).context("Invalid function manifest")
}
