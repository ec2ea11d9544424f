//! 单轮状态：贯穿整条编排流水线的工作单元
//!
//! ConversationTurnState 每条入站消息新建一份，用上一轮检查点的历史（只读）做种子，
//! 由各节点依次修改，最终回复产出后丢弃或写回检查点。
//! 迭代/重试计数器只能由状态机递增（`pub(crate)` 方法），节点只读。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::{Message, Role};

/// 路由目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RouteTarget {
    /// 需要知识库检索
    RagQuery,
    /// 工具 / Agent 路径
    Agent,
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RagQuery => "rag_query",
            Self::Agent => "agent",
        }
    }
}

/// 路由决策（每轮恰好一个，写入后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub rationale: String,
}

/// 业务流程类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    SurveyGeneration,
    CvAnalysis,
    FinancialAdvice,
    General,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SurveyGeneration => "survey_generation",
            Self::CvAnalysis => "cv_analysis",
            Self::FinancialAdvice => "financial_advice",
            Self::General => "general",
        }
    }
}

/// 业务流程分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessProcess {
    pub process_type: ProcessType,
    /// 按优先级降序（同优先级保持声明顺序）
    pub triggered_rules: Vec<String>,
    /// 该流程强制要求的工具（去重，保持首次出现顺序）
    pub required_tools: Vec<String>,
}

impl BusinessProcess {
    pub fn general() -> Self {
        Self {
            process_type: ProcessType::General,
            triggered_rules: Vec::new(),
            required_tools: Vec::new(),
        }
    }
}

/// 是否使用工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    UseTools,
    NoTools,
}

/// 最终决策由哪一层给出
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideSource {
    Llm,
    Business,
    Safety,
    None,
}

/// 工具决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecision {
    pub decision: Decision,
    /// [0, 1]
    pub confidence: f32,
    pub tools_needed: Vec<String>,
    pub rationale: String,
    pub override_source: OverrideSource,
}

impl ToolDecision {
    pub fn no_tools(rationale: impl Into<String>) -> Self {
        Self {
            decision: Decision::NoTools,
            confidence: 1.0,
            tools_needed: Vec::new(),
            rationale: rationale.into(),
            override_source: OverrideSource::None,
        }
    }

    pub fn uses_tools(&self) -> bool {
        self.decision == Decision::UseTools
    }
}

/// 检索来源知识库
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKb {
    Conversation,
    Global,
}

impl SourceKb {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Global => "global",
        }
    }
}

/// 检索片段；产出后不可变，合并只做重排与过滤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub text: String,
    pub source_kb: SourceKb,
    pub score: f32,
    pub provenance_id: String,
}

/// 安全级别（可比较：Low < Medium < High < Critical）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High / Critical 为阻断级
    pub fn is_blocking(&self) -> bool {
        *self >= Severity::High
    }
}

/// 护栏校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub safe: bool,
    pub severity: Severity,
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_text: Option<String>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            safe: true,
            severity: Severity::Low,
            violations: Vec::new(),
            modified_text: None,
        }
    }

    /// 不安全且为阻断级
    pub fn blocks(&self) -> bool {
        !self.safe && self.severity.is_blocking()
    }
}

/// 单轮状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurnState {
    pub session_id: String,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    /// 角色标注消息；轮内只追加
    pub messages: Vec<Message>,
    /// 承接历史条数（messages 前 carried_over 条来自上一轮，只读）
    carried_over: usize,
    routing_decision: Option<RoutingDecision>,
    pub business_process: Option<BusinessProcess>,
    pub tool_decision: Option<ToolDecision>,
    pub queries: Vec<String>,
    pub retrieved_context: Vec<RetrievedChunk>,
    pub merged_context: String,
    tool_iteration_count: u32,
    retry_count: u32,
    pub input_validation: Option<ValidationResult>,
    pub output_validation: Option<ValidationResult>,
    /// 当前候选回复（agent_respond 产出，output_validation 审核）
    pub draft_reply: Option<String>,
}

impl ConversationTurnState {
    /// 新建一轮：承接历史 + 本轮用户消息
    pub fn new(
        session_id: impl Into<String>,
        prior_messages: Vec<Message>,
        user_message: impl Into<String>,
    ) -> Self {
        let carried_over = prior_messages.len();
        let mut messages = prior_messages;
        messages.push(Message::user(user_message));
        Self {
            session_id: session_id.into(),
            user_id: None,
            conversation_id: None,
            messages,
            carried_over,
            routing_decision: None,
            business_process: None,
            tool_decision: None,
            queries: Vec::new(),
            retrieved_context: Vec::new(),
            merged_context: String::new(),
            tool_iteration_count: 0,
            retry_count: 0,
            input_validation: None,
            output_validation: None,
            draft_reply: None,
        }
    }

    pub fn with_identity(mut self, user_id: Option<String>, conversation_id: Option<String>) -> Self {
        self.user_id = user_id;
        self.conversation_id = conversation_id;
        self
    }

    /// 本轮最后一条用户消息
    pub fn last_user_message(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    /// 上一轮承接的历史（只读）
    pub fn prior_messages(&self) -> &[Message] {
        &self.messages[..self.carried_over.min(self.messages.len())]
    }

    /// 本轮新增的消息
    pub fn turn_messages(&self) -> &[Message] {
        &self.messages[self.carried_over.min(self.messages.len())..]
    }

    pub fn push_message(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn routing_decision(&self) -> Option<&RoutingDecision> {
        self.routing_decision.as_ref()
    }

    /// 写入路由决策；已有决策时保持原值并返回 false
    pub fn set_routing_decision(&mut self, decision: RoutingDecision) -> bool {
        if self.routing_decision.is_some() {
            tracing::warn!(session = %self.session_id, "routing decision already set, ignoring new one");
            return false;
        }
        self.routing_decision = Some(decision);
        true
    }

    pub fn tool_iteration_count(&self) -> u32 {
        self.tool_iteration_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn increment_tool_iteration(&mut self) -> u32 {
        self.tool_iteration_count += 1;
        self.tool_iteration_count
    }

    pub(crate) fn increment_retry(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// 最近一条 assistant 消息是否携带工具调用
    pub fn last_assistant_has_tool_calls(&self) -> bool {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .is_some_and(Message::has_tool_calls)
    }

    /// 本轮最近的工具结果（按时间顺序）
    pub fn latest_tool_results(&self) -> Vec<&Message> {
        let turn = self.turn_messages();
        let last_call_idx = turn.iter().rposition(Message::has_tool_calls);
        match last_call_idx {
            Some(idx) => turn[idx + 1..].iter().filter(|m| m.role == Role::Tool).collect(),
            None => Vec::new(),
        }
    }

    pub fn rag_used(&self) -> bool {
        !self.merged_context.is_empty()
    }
}
