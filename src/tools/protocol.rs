//! 工具调用协议与 LLM 输出解析
//!
//! agent_respond 节点要求 LLM 输出纯文本回复，或 `{"tool_calls": [{"tool": "...", "args": {...}}]}`。
//! 也兼容单个 `{"tool": "...", "args": {...}}`。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::llm::{extract_json_block, schema_json};

/// 单次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolCall {
    /// 工具名
    pub tool: String,
    /// 工具参数（JSON 对象）
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }
}

/// 多工具调用格式（仅用于 Schema 生成与解析）
#[derive(Debug, Deserialize, JsonSchema)]
struct ToolCallBatch {
    tool_calls: Vec<ToolCall>,
}

/// agent_respond 的 LLM 输出
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    /// 直接回复用户
    Reply(String),
    /// 需要执行工具
    ToolCalls(Vec<ToolCall>),
}

/// 解析 LLM 输出：含合法工具调用 JSON 则为 ToolCalls，否则整段作为 Reply。
///
/// 与严格的结构化决策不同，这里 JSON 不合法时不报错而是当作普通文本回复，避免丢失回答。
pub fn parse_agent_output(output: &str) -> AgentOutput {
    let trimmed = output.trim();
    let Some(json) = extract_json_block(trimmed) else {
        return AgentOutput::Reply(trimmed.to_string());
    };

    if let Ok(batch) = serde_json::from_str::<ToolCallBatch>(json) {
        let calls: Vec<ToolCall> = batch
            .tool_calls
            .into_iter()
            .filter(|c| !c.tool.trim().is_empty())
            .collect();
        if !calls.is_empty() {
            return AgentOutput::ToolCalls(calls);
        }
    }
    if let Ok(single) = serde_json::from_str::<ToolCall>(json) {
        if !single.tool.trim().is_empty() {
            return AgentOutput::ToolCalls(vec![single]);
        }
    }
    AgentOutput::Reply(trimmed.to_string())
}

/// 工具调用格式的 JSON Schema，拼入 system prompt
pub fn tool_call_schema_json() -> String {
    schema_json::<ToolCallBatch>()
}
