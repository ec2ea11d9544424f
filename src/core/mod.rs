//! 核心编排层：单轮状态、错误分类、检查点、状态机与进程级运行时
//!
//! 入口是 [`process_message`]：读取检查点 → 承接历史 → 在整轮超时内跑状态机 → 写回检查点。

pub mod checkpoint;
pub mod error;
pub mod machine;
pub mod metadata;
pub mod runtime;
pub mod state;

use std::time::Instant;

use tokio::time::timeout;

pub use checkpoint::{create_checkpoint_store, CheckpointError, CheckpointStore, InMemoryCheckpointStore};
#[cfg(feature = "async-sqlite")]
pub use checkpoint::SqliteCheckpointStore;
pub use error::OrchestrationError;
pub use machine::{Node, AGENT_SYSTEM_PROMPT};
pub use metadata::{FallbackRecord, TurnMetadata, TurnOutcome, TurnReply};
pub use runtime::{create_llm_from_config, OrchestratorRuntime, RuntimeBuilder};
pub use state::{
    BusinessProcess, ConversationTurnState, Decision, OverrideSource, ProcessType, RetrievedChunk,
    RouteTarget, RoutingDecision, Severity, SourceKb, ToolDecision, ValidationResult,
};

use crate::config::ConfigOverride;
use crate::memory::ConversationMemory;
use machine::TurnRun;

/// 检查点键：会话与用户各有前缀，互不相通；匿名轮次没有键
pub fn checkpoint_key(user_id: Option<&str>, conversation_id: Option<&str>) -> Option<String> {
    match (conversation_id, user_id) {
        (Some(conv), _) => Some(format!("conv:{conv}")),
        (None, Some(user)) => Some(format!("user:{user}")),
        (None, None) => None,
    }
}

/// 处理一条用户消息，返回最终回复与本轮元数据
///
/// - session_id 取 conversation_id，其次 user_id，都没有时生成一次性 UUID
/// - 检查点按 [`checkpoint_key`] 读写；匿名轮次既不读也不写
/// - 只有输入被拒与整轮超时会以独立结果（`TurnOutcome`）返回，其余失败都已降级吸收
/// - 超时的轮次不写检查点，下一轮看到的仍是上一次完成的状态
pub async fn process_message(
    runtime: &OrchestratorRuntime,
    user_message: &str,
    user_id: Option<&str>,
    conversation_id: Option<&str>,
    config_override: Option<&ConfigOverride>,
) -> TurnReply {
    let started = Instant::now();
    let session_id = conversation_id
        .or(user_id)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let key = checkpoint_key(user_id, conversation_id);

    let config = match config_override {
        Some(over) => runtime.config.with_override(over),
        None => runtime.config.clone(),
    };
    let turn_timeout = config.turn_timeout;
    let timeout_message = config.messages.turn_timeout.clone();

    tracing::info!(session = %session_id, chars = user_message.chars().count(), "turn started");

    let turn = async {
        let loaded = match key.as_deref() {
            Some(key) => runtime.checkpoints.get(key).await,
            None => Ok(None),
        };
        let prior = match loaded {
            Ok(Some(snapshot)) => {
                ConversationMemory::from_checkpoint(&snapshot.messages, config.max_context_turns)
                    .into_messages()
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "failed to load checkpoint, starting fresh");
                Vec::new()
            }
        };
        let state = ConversationTurnState::new(session_id.clone(), prior, user_message)
            .with_identity(
                user_id.map(str::to_string),
                conversation_id.map(str::to_string),
            );

        let result = TurnRun::new(runtime, config, state).run().await;
        if let (true, Some(key)) = (result.persist, key.as_deref()) {
            if let Err(e) = runtime.checkpoints.put(key, &result.state).await {
                tracing::warn!(session = %session_id, error = %e, "failed to save checkpoint");
            }
        }
        result
    };

    let mut reply = match timeout(turn_timeout, turn).await {
        Ok(result) => TurnReply {
            reply: result.reply,
            metadata: result.metadata,
        },
        Err(_) => {
            let err = OrchestrationError::TurnTimeout(turn_timeout);
            tracing::warn!(session = %session_id, error = %err, "turn timed out");
            let mut metadata = TurnMetadata::new(session_id.clone());
            metadata.outcome = TurnOutcome::TimedOut;
            metadata.record(&err);
            TurnReply {
                reply: timeout_message,
                metadata,
            }
        }
    };

    reply.metadata.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        session = %session_id,
        outcome = ?reply.metadata.outcome,
        tool_iterations = reply.metadata.tool_iterations,
        retries = reply.metadata.retry_count,
        rag_used = reply.metadata.rag_used,
        duration_ms = reply.metadata.duration_ms,
        "turn finished"
    );
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_key_namespaces() {
        assert_eq!(checkpoint_key(Some("42"), None).as_deref(), Some("user:42"));
        assert_eq!(checkpoint_key(Some("u1"), Some("42")).as_deref(), Some("conv:42"));
        assert_eq!(checkpoint_key(None, Some("42")).as_deref(), Some("conv:42"));
        assert!(checkpoint_key(None, None).is_none());
    }
}
