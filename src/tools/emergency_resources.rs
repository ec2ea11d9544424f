//! 紧急求助资源工具：安全覆盖（safety override）命中时强制调用

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

pub const EMERGENCY_TOOL_NAME: &str = "emergency_resources";

pub struct EmergencyResourcesTool;

#[async_trait]
impl Tool for EmergencyResourcesTool {
    fn name(&self) -> &str {
        EMERGENCY_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Return crisis-support guidance and emergency contact options. Use whenever the user may be at risk."
    }

    async fn invoke(&self, _args: Value) -> Result<Value, ToolError> {
        Ok(serde_json::json!({
            "message": "You are not alone. If you are in immediate danger, contact your local emergency number right now.",
            "resources": [
                { "name": "Emergency services", "contact": "112 (EU) / 911 (US) / local emergency number" },
                { "name": "988 Suicide & Crisis Lifeline (US)", "contact": "Call or text 988" },
                { "name": "International crisis lines directory", "contact": "https://findahelpline.com" }
            ]
        }))
    }
}
