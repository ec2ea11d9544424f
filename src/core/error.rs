//! 编排错误分类
//!
//! 只有 InputRejected 与 TurnTimeout 作为独立结果暴露给调用方；其余条件在节点内吸收，
//! 降级为仍然可用的回复，并以 `code()` 记录到 TurnMetadata。

use std::time::Duration;

use thiserror::Error;

use crate::core::state::Severity;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestrationError {
    /// 护栏阻断输入
    #[error("Input rejected by guardrail ({severity:?}): {violations:?}")]
    InputRejected {
        severity: Severity,
        violations: Vec<String>,
    },

    /// 一个或两个知识库失败 / 为空
    #[error("Retrieval degraded: {0}")]
    RetrievalDegraded(String),

    /// 请求了未知工具
    #[error("Unknown tool: {0}")]
    ToolResolution(String),

    /// 工具执行失败（含超时）
    #[error("Tool {tool} failed: {reason}")]
    ToolExecution { tool: String, reason: String },

    /// 结构化 LLM 决策失败，已替换为确定性默认值
    #[error("Decision fallback at {stage}: {reason}")]
    DecisionFallback { stage: String, reason: String },

    /// 工具循环或重试循环达到上限
    #[error("{what} limit reached ({limit})")]
    IterationLimitReached { what: String, limit: u32 },

    /// 整轮超时
    #[error("Turn timed out after {0:?}")]
    TurnTimeout(Duration),
}

impl OrchestrationError {
    /// 元数据中使用的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InputRejected { .. } => "input_rejected",
            Self::RetrievalDegraded(_) => "retrieval_degraded",
            Self::ToolResolution(_) => "tool_resolution_error",
            Self::ToolExecution { .. } => "tool_execution_error",
            Self::DecisionFallback { .. } => "decision_fallback",
            Self::IterationLimitReached { .. } => "iteration_limit_reached",
            Self::TurnTimeout(_) => "turn_timeout",
        }
    }

    /// 是否作为独立结果暴露给调用方
    pub fn is_surfaced(&self) -> bool {
        matches!(self, Self::InputRejected { .. } | Self::TurnTimeout(_))
    }
}
