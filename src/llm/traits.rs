//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / 脚本化测试客户端）实现 LlmClient::complete。
//! 结构化决策（路由、工具决策）建立在 complete 之上，见 `structured`。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM returned an empty response")]
    EmptyResponse,

    #[error("LLM structured output invalid: {0}")]
    InvalidStructuredOutput(String),
}

/// 单次调用参数（每轮可被 ConfigOverride 覆盖）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { temperature: 0.2 }
    }
}

/// LLM 客户端 trait：进程级共享，必须可并发调用
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；messages 首条通常为 system
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
