//! 单轮结果与元数据
//!
//! `process_message` 的返回值：最终回复文本 + 可序列化的 TurnMetadata。
//! 被吸收的错误以 FallbackRecord 形式记录，`error` 字段保存最重要的一条（可观测用）。

use serde::Serialize;

use crate::core::{
    BusinessProcess, OrchestrationError, RoutingDecision, ToolDecision, ValidationResult,
};
use crate::retrieval::SourceRecord;

/// 本轮如何结束
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// 正常通过输出校验
    Completed,
    /// 有降级（工具上限、生成失败等），但仍给出可用回复
    Degraded,
    /// 输出重试用尽，附加了免责声明
    Disclaimed,
    /// 输入被护栏阻断
    InputRejected,
    /// 整轮超时
    TimedOut,
}

/// 一条被吸收的错误
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackRecord {
    pub code: String,
    pub message: String,
}

impl From<&OrchestrationError> for FallbackRecord {
    fn from(e: &OrchestrationError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnMetadata {
    pub session_id: String,
    pub outcome: TurnOutcome,
    pub routing: Option<RoutingDecision>,
    pub business_process: Option<BusinessProcess>,
    pub tool_decision: Option<ToolDecision>,
    pub rag_used: bool,
    pub queries: Vec<String>,
    pub sources: Vec<SourceRecord>,
    pub tools_used: Vec<String>,
    pub tool_iterations: u32,
    pub retry_count: u32,
    pub input_validation: Option<ValidationResult>,
    pub output_validation: Option<ValidationResult>,
    pub fallbacks: Vec<FallbackRecord>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl TurnMetadata {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            outcome: TurnOutcome::Completed,
            routing: None,
            business_process: None,
            tool_decision: None,
            rag_used: false,
            queries: Vec::new(),
            sources: Vec::new(),
            tools_used: Vec::new(),
            tool_iterations: 0,
            retry_count: 0,
            input_validation: None,
            output_validation: None,
            fallbacks: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    /// 记录被吸收的错误；第一条成为 `error`
    pub fn record(&mut self, err: &OrchestrationError) {
        self.record_code(err.code(), err.to_string());
    }

    /// 记录不属于编排错误分类的降级（如护栏自身故障）
    pub fn record_code(&mut self, code: &str, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(code.to_string());
        }
        self.fallbacks.push(FallbackRecord {
            code: code.to_string(),
            message: message.into(),
        });
    }

    pub fn has_fallback(&self, code: &str) -> bool {
        self.fallbacks.iter().any(|f| f.code == code)
    }
}

/// `processMessage` 的返回值
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub reply: String,
    pub metadata: TurnMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_recorded_error_wins() {
        let mut meta = TurnMetadata::new("s");
        meta.record(&OrchestrationError::RetrievalDegraded("global down".into()));
        meta.record(&OrchestrationError::ToolResolution("ghost".into()));
        assert_eq!(meta.error.as_deref(), Some("retrieval_degraded"));
        assert_eq!(meta.fallbacks.len(), 2);
        assert!(meta.has_fallback("tool_resolution_error"));
    }

    #[test]
    fn test_metadata_serializes_snake_case() {
        let mut meta = TurnMetadata::new("s");
        meta.outcome = TurnOutcome::InputRejected;
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["outcome"], "input_rejected");
        assert_eq!(json["rag_used"], false);
    }
}
