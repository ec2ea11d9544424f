//! 对话消息与历史承接
//!
//! Message 是贯穿整轮编排的角色标注消息；ConversationMemory 负责把上一轮检查点里的历史
//! 裁剪到最近 N 轮后承接进新一轮（只读种子，不回写）。

use serde::{Deserialize, Serialize};

use crate::tools::ToolCall;

/// 消息角色（与 LLM API 一致，额外包含 Tool 结果）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// assistant 消息携带的工具调用（非空即为 tool-call-bearing turn）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// tool 消息对应的工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// 携带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    /// 工具结果消息
    pub fn tool(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// 历史承接：最近 N 轮对话（每轮含 user + assistant，故实际保留约 max_turns*2 条消息）
///
/// 工具消息与携带工具调用的中间 assistant 消息不进入承接历史，只保留用户可见的对话。
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns,
        }
    }

    /// 从检查点消息构建，过滤掉中间工具往返并裁剪
    pub fn from_checkpoint(messages: &[Message], max_turns: usize) -> Self {
        let mut memory = Self::new(max_turns);
        for msg in messages {
            let visible = match msg.role {
                Role::User => true,
                Role::Assistant => !msg.has_tool_calls(),
                Role::Tool | Role::System => false,
            };
            if visible {
                memory.push(msg.clone());
            }
        }
        memory
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// 超出 max_turns*2 时丢弃最旧的消息，保留最近部分
    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.messages.len() > keep {
            self.messages.drain(..self.messages.len() - keep);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent_turns() {
        let mut memory = ConversationMemory::new(1);
        memory.push(Message::user("a"));
        memory.push(Message::assistant("b"));
        memory.push(Message::user("c"));
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.messages()[0].content, "b");
    }

    #[test]
    fn test_from_checkpoint_drops_tool_traffic() {
        let history = vec![
            Message::user("make a survey"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall::new("survey_generator", serde_json::json!({}))],
            ),
            Message::tool("survey_generator", "{...}"),
            Message::assistant("Here is your survey"),
        ];
        let memory = ConversationMemory::from_checkpoint(&history, 10);
        let roles: Vec<Role> = memory.messages().iter().map(|m| m.role.clone()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }
}
