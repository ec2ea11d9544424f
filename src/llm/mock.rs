//! Mock LLM 客户端（无需 API）
//!
//! - MockLlmClient：回显最后一条 User 消息；结构化调用会因无 JSON 而走确定性兜底，便于离线跑通流程。
//! - ScriptedLlmClient：由闭包决定每次回复，并统计调用次数，供测试断言。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::llm::{CompletionOptions, LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {}", last_user))
    }
}

type Responder = dyn Fn(&[Message]) -> Result<String, LlmError> + Send + Sync;

/// 脚本化客户端：回复由闭包生成
pub struct ScriptedLlmClient {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// 所有调用都失败
    pub fn failing() -> Self {
        Self::new(|_| Err(LlmError::Request("scripted failure".to_string())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(messages)
    }
}

/// 取 system prompt（首条 System 消息），测试中用于区分不同节点的调用
pub fn system_prompt_of(messages: &[Message]) -> &str {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}
