use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::orchestration::Tool;

/// Returns its arguments unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    async fn call(&self, args: &Value) -> Result<Value, ToolError> {
        Ok(args.clone())
    }
}
