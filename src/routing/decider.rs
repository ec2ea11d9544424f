//! 路由决策：rag_query 还是 agent
//!
//! 先做关键词快速匹配（配置的 RAG 关键词，不调用 LLM），未命中再发起一次结构化 LLM 调用。
//! LLM 失败一律回落到 agent 路径并记录 DecisionFallback，绝不因此丢弃本轮。

use std::sync::Arc;

use crate::core::{ConversationTurnState, OrchestrationError, RouteTarget, RoutingDecision};
use crate::llm::{invoke_structured, CompletionOptions, LlmClient};
use crate::memory::tokenizer::contains_keyword;
use crate::memory::Message;

/// 路由节点的 system prompt
pub const ROUTING_SYSTEM_PROMPT: &str = "You are a routing classifier for a conversational assistant. Choose \"rag_query\" when answering needs facts from the knowledge base or the user's uploaded documents (definitions, explanations, policies, document questions). Choose \"agent\" for small talk, actions, calculations, or anything that needs tools.";

/// 路由结果与可能的降级记录
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub decision: RoutingDecision,
    pub fallback: Option<OrchestrationError>,
}

pub struct RoutingDecider {
    llm: Arc<dyn LlmClient>,
    rag_keywords: Vec<String>,
    use_llm: bool,
}

impl RoutingDecider {
    pub fn new(llm: Arc<dyn LlmClient>, rag_keywords: Vec<String>) -> Self {
        Self {
            llm,
            rag_keywords,
            use_llm: true,
        }
    }

    /// 关闭 LLM 路由，仅用关键词
    pub fn rules_only(mut self) -> Self {
        self.use_llm = false;
        self
    }

    pub fn with_llm(mut self, use_llm: bool) -> Self {
        self.use_llm = use_llm;
        self
    }

    /// `decide(turnState) -> RoutingDecision`
    pub async fn decide(&self, state: &ConversationTurnState, options: &CompletionOptions) -> RoutingOutcome {
        let message = state.last_user_message().trim();
        if message.is_empty() {
            return RoutingOutcome {
                decision: agent("empty input"),
                fallback: None,
            };
        }

        if let Some(keyword) = self.rag_keywords.iter().find(|k| contains_keyword(message, k)) {
            return RoutingOutcome {
                decision: RoutingDecision {
                    target: RouteTarget::RagQuery,
                    rationale: format!("matched knowledge keyword '{keyword}'"),
                },
                fallback: None,
            };
        }

        if !self.use_llm {
            return RoutingOutcome {
                decision: agent("no knowledge keyword matched"),
                fallback: None,
            };
        }

        let mut messages: Vec<Message> = state
            .prior_messages()
            .iter()
            .rev()
            .filter(|m| !m.has_tool_calls())
            .take(4)
            .cloned()
            .collect();
        messages.reverse();
        messages.push(Message::user(message));

        match invoke_structured::<RoutingDecision>(self.llm.as_ref(), ROUTING_SYSTEM_PROMPT, &messages, options).await {
            Ok(decision) => RoutingOutcome {
                decision,
                fallback: None,
            },
            Err(e) => {
                tracing::warn!(error = %e, "routing LLM call failed, defaulting to agent path");
                RoutingOutcome {
                    decision: agent("Fallback used: routing classifier unavailable"),
                    fallback: Some(OrchestrationError::DecisionFallback {
                        stage: "routing".to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }
}

fn agent(rationale: &str) -> RoutingDecision {
    RoutingDecision {
        target: RouteTarget::Agent,
        rationale: rationale.to_string(),
    }
}
