//! 工具执行器
//!
//! 持有 ToolRegistry、单工具超时与迭代上限。run(tool_calls, state) 逐个派发工具调用，
//! 未知工具、工具报错与超时都转成描述失败的 tool 结果消息，绝不让异常冒出节点；
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::{ConversationTurnState, OrchestrationError};
use crate::memory::Message;
use crate::tools::{ToolCall, ToolRegistry};

/// 一次工具执行轮的结果
#[derive(Debug, Default)]
pub struct ToolRun {
    /// 追加到对话的 tool 结果消息（与调用一一对应）
    pub messages: Vec<Message>,
    /// 成功执行的工具名
    pub succeeded: Vec<String>,
    /// 被吸收的错误（ToolResolution / ToolExecution）
    pub errors: Vec<OrchestrationError>,
}

/// 工具执行器：对每次调用施加超时，并将失败映射为 tool 结果消息
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_iterations: u32,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration, max_iterations: u32) -> Self {
        Self {
            registry,
            timeout,
            max_iterations,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// `run(toolCalls, turnState) -> updatedMessages`
    ///
    /// 前置条件：state 中最近的 assistant 消息携带工具调用，且迭代计数未达上限；
    /// 不满足时返回 Err，由状态机转入收尾。
    pub async fn run(
        &self,
        calls: &[ToolCall],
        state: &ConversationTurnState,
        max_iterations: Option<u32>,
    ) -> Result<ToolRun, OrchestrationError> {
        let limit = max_iterations.unwrap_or(self.max_iterations);
        if state.tool_iteration_count() >= limit {
            return Err(OrchestrationError::IterationLimitReached {
                what: "tool".to_string(),
                limit,
            });
        }
        if !state.last_assistant_has_tool_calls() {
            tracing::warn!(session = %state.session_id, "tool run requested without a preceding tool-call turn");
            return Ok(ToolRun::default());
        }

        let mut run = ToolRun::default();
        for call in calls {
            match self.execute_one(call).await {
                Ok(content) => {
                    run.succeeded.push(call.tool.clone());
                    run.messages.push(Message::tool(&call.tool, content));
                }
                Err(err) => {
                    run.messages
                        .push(Message::tool(&call.tool, user_safe_failure(&err)));
                    run.errors.push(err);
                }
            }
        }
        Ok(run)
    }

    /// 执行单个工具；超时 / 报错 / 未知工具均返回 OrchestrationError；输出 JSON 审计日志
    async fn execute_one(&self, call: &ToolCall) -> Result<String, OrchestrationError> {
        let Some(tool) = self.registry.resolve(&call.tool) else {
            tracing::warn!(tool = %call.tool, "requested tool is not registered");
            return Err(OrchestrationError::ToolResolution(call.tool.clone()));
        };

        let start = Instant::now();
        let args_preview = args_preview(&call.args);
        let result = timeout(self.timeout, tool.invoke(call.args.clone())).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.tool,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(serde_json::Value::String(s))) => Ok(s),
            Ok(Ok(value)) => Ok(value.to_string()),
            Ok(Err(e)) => Err(OrchestrationError::ToolExecution {
                tool: call.tool.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(OrchestrationError::ToolExecution {
                tool: call.tool.clone(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            }),
        }
    }
}

/// 面向终端用户的失败描述
fn user_safe_failure(err: &OrchestrationError) -> String {
    match err {
        OrchestrationError::ToolResolution(name) => {
            format!("The tool '{name}' is not available, so this step was skipped.")
        }
        OrchestrationError::ToolExecution { tool, .. } => {
            format!("The tool '{tool}' could not complete this step.")
        }
        other => other.to_string(),
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
