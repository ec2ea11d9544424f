//! 单轮编排状态机
//!
//! 节点是一个枚举，转移由 `step` 的 match 决定，不使用运行时图框架：
//!
//! ```text
//! input_validation ─(block)→ end
//!        │
//! business_classification → routing ─(rag_query)→ retrieval → tool_decision
//!                                  └─(agent)────────────────→ tool_decision
//! tool_decision → agent_respond ⇄ tools ─(iterations exhausted)→ finalize
//! agent_respond / finalize → output_validation ─(regenerate)→ agent_respond
//!                                             └→ end
//! ```
//!
//! 计数器只在这里递增：tools 节点执行完一批调用后 +1 工具迭代，output_validation 要求重生成时 +1 重试。
//! 节点内的失败都被吸收并记录进 TurnMetadata，状态机总会走到 End。

use crate::config::OrchestrationConfig;
use crate::core::{
    BusinessProcess, ConversationTurnState, OrchestrationError, OrchestratorRuntime, RouteTarget,
    TurnMetadata, TurnOutcome,
};
use crate::guardrails::{GuardrailContext, InputVerdict, OutputVerdict};
use crate::llm::CompletionOptions;
use crate::memory::{Message, Role};
use crate::retrieval::RetrievalParams;
use crate::routing::RuleContext;
use crate::tools::{parse_agent_output, tool_call_schema_json, AgentOutput, ToolCall};

pub const AGENT_SYSTEM_PROMPT: &str = "You are Hive, a helpful assistant for surveys, CV reviews and personal finance questions. Answer clearly and concisely in the user's language.";

const FINALIZE_INSTRUCTION: &str = "The tool budget for this turn is exhausted. Do not request any more tools; answer the user with the information gathered so far.";

/// 状态机节点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    InputValidation,
    BusinessClassification,
    Routing,
    Retrieval,
    ToolDecision,
    AgentRespond,
    Tools,
    Finalize,
    OutputValidation,
    End,
}

/// 一次运行的结果：最终状态（用于写检查点）、回复与元数据
pub(crate) struct TurnResult {
    pub state: ConversationTurnState,
    pub reply: String,
    pub metadata: TurnMetadata,
    /// 是否应写回检查点（输入被拒的轮次不写）
    pub persist: bool,
}

/// 单轮运行上下文：借用进程级运行时，独占本轮状态
pub(crate) struct TurnRun<'a> {
    runtime: &'a OrchestratorRuntime,
    config: OrchestrationConfig,
    options: CompletionOptions,
    guard_ctx: GuardrailContext,
    state: ConversationTurnState,
    meta: TurnMetadata,
    pending_calls: Vec<ToolCall>,
    /// 上一版草稿被护栏拒绝的原因；Some 时 agent_respond 走重写模式
    rejection: Option<Vec<String>>,
    reply: Option<String>,
    persist: bool,
}

impl<'a> TurnRun<'a> {
    pub(crate) fn new(
        runtime: &'a OrchestratorRuntime,
        config: OrchestrationConfig,
        state: ConversationTurnState,
    ) -> Self {
        let options = OrchestratorRuntime::completion_options(&config);
        let guard_ctx = GuardrailContext {
            session_id: state.session_id.clone(),
            user_id: state.user_id.clone(),
        };
        let meta = TurnMetadata::new(state.session_id.clone());
        Self {
            runtime,
            config,
            options,
            guard_ctx,
            state,
            meta,
            pending_calls: Vec::new(),
            rejection: None,
            reply: None,
            persist: true,
        }
    }

    /// 从 InputValidation 跑到 End
    pub(crate) async fn run(mut self) -> TurnResult {
        let mut node = Node::InputValidation;
        while node != Node::End {
            tracing::debug!(session = %self.state.session_id, ?node, "enter node");
            node = self.step(node).await;
        }
        self.finish()
    }

    async fn step(&mut self, node: Node) -> Node {
        match node {
            Node::InputValidation => self.input_validation().await,
            Node::BusinessClassification => self.business_classification(),
            Node::Routing => self.routing().await,
            Node::Retrieval => self.retrieval().await,
            Node::ToolDecision => self.tool_decision().await,
            Node::AgentRespond => self.agent_respond().await,
            Node::Tools => self.tools().await,
            Node::Finalize => self.finalize().await,
            Node::OutputValidation => self.output_validation().await,
            Node::End => Node::End,
        }
    }

    async fn input_validation(&mut self) -> Node {
        let text = self.state.last_user_message().to_string();
        let gate = self.runtime.gate.check_input(&text, &self.guard_ctx).await;
        if let Some(err) = &gate.error {
            self.meta.record_code("guardrail_error", err.clone());
        }
        let verdict = gate.verdict;
        let validation = gate.validation;

        if verdict == InputVerdict::Block {
            self.meta.record(&OrchestrationError::InputRejected {
                severity: validation.severity,
                violations: validation.violations.clone(),
            });
            self.meta.outcome = TurnOutcome::InputRejected;
            self.state.input_validation = Some(validation);
            self.reply = Some(self.config.messages.input_rejected.clone());
            self.persist = false;
            return Node::End;
        }
        self.state.input_validation = Some(validation);
        Node::BusinessClassification
    }

    fn business_classification(&mut self) -> Node {
        let message = self.state.last_user_message().to_string();
        let prior_turns = self
            .state
            .prior_messages()
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        let ctx = RuleContext::from_message(&message)
            .with_flag("has_conversation", self.state.conversation_id.is_some())
            .with_number("prior_turns", prior_turns as f64);
        let process = self.runtime.classifier.classify(&message, &ctx);
        self.state.business_process = Some(process);
        Node::Routing
    }

    async fn routing(&mut self) -> Node {
        let outcome = self.runtime.router.decide(&self.state, &self.options).await;
        if let Some(err) = &outcome.fallback {
            self.meta.record(err);
        }
        let target = outcome.decision.target;
        tracing::info!(target = target.as_str(), rationale = %outcome.decision.rationale, "routed");
        self.state.set_routing_decision(outcome.decision);
        match target {
            RouteTarget::RagQuery => Node::Retrieval,
            RouteTarget::Agent => Node::ToolDecision,
        }
    }

    async fn retrieval(&mut self) -> Node {
        let params = RetrievalParams {
            top_k: self.config.top_k,
            score_threshold: self.config.score_threshold,
            max_queries: self.config.max_queries_per_request,
            max_context_chars: self.config.max_context_chars,
        };
        let message = self.state.last_user_message().to_string();
        let outcome = self
            .runtime
            .retrieval
            .retrieve(
                &message,
                self.state.prior_messages(),
                self.state.conversation_id.as_deref(),
                &params,
            )
            .await;
        for err in &outcome.errors {
            self.meta.record(err);
        }
        self.state.queries = outcome.queries;
        self.state.retrieved_context = outcome.chunks;
        self.state.merged_context = outcome.merged.text;
        self.meta.sources = outcome.merged.source_breakdown;
        Node::ToolDecision
    }

    async fn tool_decision(&mut self) -> Node {
        let message = self.state.last_user_message().to_string();
        let business = self.state.business_process.clone().unwrap_or_else(BusinessProcess::general);
        let available = self.runtime.executor.tool_names();
        let outcome = self
            .runtime
            .decision_engine
            .decide(&message, &business, &available, &self.options)
            .await;
        for err in &outcome.errors {
            self.meta.record(err);
        }
        self.state.tool_decision = Some(outcome.decision);
        Node::AgentRespond
    }

    fn tools_offered(&self) -> Option<Vec<String>> {
        if self.rejection.is_some() {
            return None;
        }
        self.state
            .tool_decision
            .as_ref()
            .filter(|d| d.uses_tools() && !d.tools_needed.is_empty())
            .map(|d| d.tools_needed.clone())
    }

    fn system_prompt(&self, tools: Option<&[String]>) -> String {
        let mut prompt = AGENT_SYSTEM_PROMPT.to_string();
        if !self.state.merged_context.is_empty() {
            prompt.push_str("\n\nUse the following retrieved context when it is relevant:\n");
            prompt.push_str(&self.state.merged_context);
        }
        if let Some(names) = tools {
            prompt.push_str("\n\nYou can call these tools:\n");
            prompt.push_str(&self.runtime.executor.registry().to_schema_json(names));
            prompt.push_str(
                "\nTo call tools, respond ONLY with a JSON object matching this schema:\n",
            );
            prompt.push_str(&tool_call_schema_json());
            prompt.push_str("\nIf tool results above already answer the question, reply to the user directly.");
        }
        if let Some(violations) = &self.rejection {
            prompt.push_str(&format!(
                "\n\nYour previous draft was rejected by the safety review ({}). Rewrite the answer so it avoids that content.",
                violations.join(", ")
            ));
        }
        prompt
    }

    fn llm_messages(&self, system: String) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.state.messages.len() + 1);
        messages.push(Message::system(system));
        messages.extend_from_slice(&self.state.messages);
        messages
    }

    async fn agent_respond(&mut self) -> Node {
        let tools = self.tools_offered();
        let messages = self.llm_messages(self.system_prompt(tools.as_deref()));

        let raw = match self.runtime.llm.complete(&messages, &self.options).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "reply generation failed");
                self.meta.record_code("generation_failed", e.to_string());
                self.meta.outcome = TurnOutcome::Degraded;
                self.state.draft_reply = Some(self.fallback_reply());
                return Node::OutputValidation;
            }
        };

        let Some(tools) = tools else {
            self.state.draft_reply = Some(raw.trim().to_string());
            return Node::OutputValidation;
        };

        match parse_agent_output(&raw) {
            AgentOutput::ToolCalls(calls) => self.queue_calls(calls),
            AgentOutput::Reply(text) if self.state.tool_iteration_count() == 0 => {
                // 决策要求工具但模型直接作答：首轮按决策合成调用
                let message = self.state.last_user_message().to_string();
                let calls = tools
                    .iter()
                    .map(|t| ToolCall::new(t, serde_json::json!({ "input": message })))
                    .collect();
                tracing::debug!(ignored = %text, "model skipped required tools, synthesizing calls");
                self.queue_calls(calls)
            }
            AgentOutput::Reply(text) => {
                self.state.draft_reply = Some(text);
                Node::OutputValidation
            }
        }
    }

    /// 预算内则登记工具调用进入 tools；预算已用尽则直接收尾
    fn queue_calls(&mut self, calls: Vec<ToolCall>) -> Node {
        let limit = self.config.max_tool_iterations;
        if self.state.tool_iteration_count() >= limit {
            self.meta.record(&OrchestrationError::IterationLimitReached {
                what: "tool".to_string(),
                limit,
            });
            return Node::Finalize;
        }
        self.state
            .push_message(Message::assistant_with_calls("", calls.clone()));
        self.pending_calls = calls;
        Node::Tools
    }

    async fn tools(&mut self) -> Node {
        let limit = self.config.max_tool_iterations;
        let calls = std::mem::take(&mut self.pending_calls);
        let result = self.runtime.executor.run(&calls, &self.state, Some(limit)).await;
        match result {
            Ok(run) => {
                for err in &run.errors {
                    self.meta.record(err);
                }
                for tool in run.succeeded {
                    if !self.meta.tools_used.contains(&tool) {
                        self.meta.tools_used.push(tool);
                    }
                }
                for msg in run.messages {
                    self.state.push_message(msg);
                }
                let n = self.state.increment_tool_iteration();
                tracing::debug!(iteration = n, limit, "tool iteration complete");
                Node::AgentRespond
            }
            Err(err) => {
                tracing::warn!(error = %err, "tool loop stopped");
                self.meta.record(&err);
                Node::Finalize
            }
        }
    }

    /// 工具预算用尽：请模型不带工具作答；再失败则用最近工具结果拼出降级回复
    async fn finalize(&mut self) -> Node {
        self.meta.outcome = TurnOutcome::Degraded;
        let system = format!("{}\n\n{}", self.system_prompt(None), FINALIZE_INSTRUCTION);
        let messages = self.llm_messages(system);
        let draft = match self.runtime.llm.complete(&messages, &self.options).await {
            Ok(raw) => match parse_agent_output(&raw) {
                AgentOutput::Reply(text) if !text.is_empty() => text,
                _ => self.fallback_reply(),
            },
            Err(e) => {
                tracing::warn!(error = %e, "final answer generation failed");
                self.meta.record_code("generation_failed", e.to_string());
                self.fallback_reply()
            }
        };
        self.state.draft_reply = Some(draft);
        Node::OutputValidation
    }

    /// 有工具结果时：降级说明 + 最近工具结果；否则固定的生成失败文案
    fn fallback_reply(&self) -> String {
        let results = self.state.latest_tool_results();
        if results.is_empty() {
            return self.config.messages.generation_failed.clone();
        }
        let body: Vec<&str> = results.iter().map(|m| m.content.as_str()).collect();
        format!("{}\n\n{}", self.config.messages.degraded_answer, body.join("\n\n"))
    }

    async fn output_validation(&mut self) -> Node {
        let draft = self.state.draft_reply.clone().unwrap_or_default();
        let gate = self
            .runtime
            .gate
            .check_output(
                &draft,
                &self.guard_ctx,
                self.state.retry_count(),
                self.config.max_output_retries,
                &self.config.messages.output_disclaimer,
            )
            .await;
        if let Some(err) = &gate.error {
            self.meta.record_code("guardrail_error", err.clone());
        }
        let violations = gate.validation.violations.clone();
        self.state.output_validation = Some(gate.validation);

        match gate.verdict {
            OutputVerdict::Accept(text) => {
                self.reply = Some(text);
                Node::End
            }
            OutputVerdict::Regenerate => {
                self.state.increment_retry();
                self.rejection = Some(violations);
                Node::AgentRespond
            }
            OutputVerdict::Disclaim(text) => {
                self.meta.record(&OrchestrationError::IterationLimitReached {
                    what: "output retry".to_string(),
                    limit: self.config.max_output_retries,
                });
                self.meta.outcome = TurnOutcome::Disclaimed;
                self.reply = Some(text);
                Node::End
            }
        }
    }

    fn finish(mut self) -> TurnResult {
        let reply = self
            .reply
            .take()
            .unwrap_or_else(|| self.config.messages.generation_failed.clone());
        if self.persist {
            self.state.push_message(Message::assistant(reply.clone()));
        }

        let meta = &mut self.meta;
        meta.routing = self.state.routing_decision().cloned();
        meta.business_process = self.state.business_process.clone();
        meta.tool_decision = self.state.tool_decision.clone();
        meta.rag_used = self.state.rag_used();
        meta.queries = self.state.queries.clone();
        meta.tool_iterations = self.state.tool_iteration_count();
        meta.retry_count = self.state.retry_count();
        meta.input_validation = self.state.input_validation.clone();
        meta.output_validation = self.state.output_validation.clone();

        TurnResult {
            state: self.state,
            reply,
            metadata: self.meta,
            persist: self.persist,
        }
    }
}
