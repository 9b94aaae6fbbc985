//! Runs a local process.
//!
//! Arguments: `{"program": "...", "args": ["..."], "cwd": "...", "env": {..}}`.
//! Only `program` is required. The result carries the exit code and the
//! trimmed stdout/stderr. A non-zero exit is a permanent failure; the
//! process is killed if the invoker's timeout drops the call.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::process::Command;

use crate::error::ToolError;
use crate::orchestration::Tool;

#[derive(Debug, Deserialize)]
struct CommandArgs {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTool;

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        "command"
    }

    async fn call(&self, args: &Value) -> Result<Value, ToolError> {
        let args: CommandArgs = serde_json::from_value(args.clone())
            .map_err(|e| ToolError::Permanent(format!("invalid command arguments: {}", e)))?;

        let mut command = Command::new(&args.program);
        command.args(&args.args).envs(&args.env).kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                ToolError::Permanent(format!("cannot run {}: {}", args.program, e))
            }
            _ => ToolError::Transient(format!("failed to run {}: {}", args.program, e)),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code();

        if !output.status.success() {
            let detail = if stderr.is_empty() {
                format!("exit code {}", code.unwrap_or(-1))
            } else {
                stderr
            };
            return Err(ToolError::Permanent(format!(
                "{} failed: {}",
                args.program, detail
            )));
        }

        Ok(json!({
            "code": code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}
