//! Echo 工具（诊断用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

/// Echo 工具：回显 text（或 input）
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (diagnostics). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": []
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let text = args
            .get("text")
            .or_else(|| args.get("input"))
            .and_then(Value::as_str)
            .unwrap_or("(empty)");
        Ok(Value::String(text.to_string()))
    }
}
