//! 工具决策引擎
//!
//! 三层叠加，优先级从高到低：
//! 1. 安全关键词覆盖：命中即强制 use_tools 并把对应工具放在首位（override_source = safety）
//! 2. 业务流程覆盖：流程要求工具而主决策未包含时补齐（override_source = business）
//! 3. LLM 结构化主决策（override_source = llm）
//!
//! 依次计算主决策、业务层、安全层，后一层覆盖前一层，最终结果记录触发的是哪一层。
//! LLM 失败时走确定性兜底：业务流程要求工具或命中兜底关键词则 use_tools，否则 no_tools。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::core::{BusinessProcess, Decision, OrchestrationError, OverrideSource, ToolDecision};
use crate::llm::{invoke_structured, CompletionOptions, LlmClient};
use crate::memory::tokenizer::contains_keyword;
use crate::memory::Message;
use crate::tools::{
    CV_TOOL_NAME, EMERGENCY_TOOL_NAME, FINANCE_TOOL_NAME, SURVEY_TOOL_NAME,
};

/// 工具决策节点的 system prompt 前缀
pub const TOOL_DECISION_PROMPT: &str = "You are a tool-selection assistant. Decide whether answering the user's latest message requires calling tools. Only choose tool names from the available list.";

/// LLM 结构化输出
#[derive(Debug, Deserialize, JsonSchema)]
struct LlmToolDecision {
    /// use_tools 或 no_tools
    decision: Decision,
    /// 0 到 1 的置信度
    #[serde(default)]
    confidence: f32,
    /// 需要调用的工具名（有序）
    #[serde(default)]
    tools_needed: Vec<String>,
    #[serde(default)]
    rationale: String,
}

/// 关键词触发器：任一关键词命中即指向 tool
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KeywordTrigger {
    pub tool: String,
    pub keywords: Vec<String>,
}

impl KeywordTrigger {
    pub fn new(tool: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            tool: tool.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn matches(&self, message: &str) -> bool {
        self.keywords.iter().any(|k| contains_keyword(message, k))
    }
}

/// 决策结果与过程中吸收的错误（DecisionFallback / ToolResolution）
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: ToolDecision,
    pub errors: Vec<OrchestrationError>,
}

pub struct ToolDecisionEngine {
    llm: Arc<dyn LlmClient>,
    safety_triggers: Vec<KeywordTrigger>,
    fallback_triggers: Vec<KeywordTrigger>,
}

impl ToolDecisionEngine {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            safety_triggers: default_safety_triggers(),
            fallback_triggers: default_fallback_triggers(),
        }
    }

    pub fn with_safety_triggers(mut self, triggers: Vec<KeywordTrigger>) -> Self {
        self.safety_triggers = triggers;
        self
    }

    pub fn with_fallback_triggers(mut self, triggers: Vec<KeywordTrigger>) -> Self {
        self.fallback_triggers = triggers;
        self
    }

    /// `decide(message, businessProcess, availableToolNames) -> ToolDecision`
    pub async fn decide(
        &self,
        message: &str,
        business: &BusinessProcess,
        available: &[String],
        options: &CompletionOptions,
    ) -> DecisionOutcome {
        let mut errors = Vec::new();

        let primary = self.primary(message, business, available, options, &mut errors).await;
        let with_business = apply_business(primary, business, available, &mut errors);
        let decision = self.apply_safety(with_business, message, available, &mut errors);

        tracing::info!(
            decision = ?decision.decision,
            tools = ?decision.tools_needed,
            source = ?decision.override_source,
            "tool decision"
        );
        DecisionOutcome { decision, errors }
    }

    /// 第 3 层：LLM 主决策；失败时用确定性兜底并记录 DecisionFallback
    async fn primary(
        &self,
        message: &str,
        business: &BusinessProcess,
        available: &[String],
        options: &CompletionOptions,
        errors: &mut Vec<OrchestrationError>,
    ) -> ToolDecision {
        let system = format!(
            "{TOOL_DECISION_PROMPT}\nAvailable tools: {}\nBusiness process: {}",
            if available.is_empty() {
                "(none)".to_string()
            } else {
                available.join(", ")
            },
            business.process_type.as_str()
        );
        let result = invoke_structured::<LlmToolDecision>(
            self.llm.as_ref(),
            &system,
            &[Message::user(message)],
            options,
        )
        .await;

        match result {
            Ok(raw) => {
                let tools = filter_known(raw.tools_needed, available, errors);
                let decision = if raw.decision == Decision::UseTools && tools.is_empty() {
                    Decision::NoTools
                } else {
                    raw.decision
                };
                ToolDecision {
                    decision,
                    confidence: sanitize_confidence(raw.confidence),
                    tools_needed: if decision == Decision::UseTools { tools } else { Vec::new() },
                    rationale: raw.rationale,
                    override_source: OverrideSource::Llm,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "tool decision LLM call failed, using fallback");
                errors.push(OrchestrationError::DecisionFallback {
                    stage: "tool_decision".to_string(),
                    reason: e.to_string(),
                });
                self.fallback(message, business, available)
            }
        }
    }

    fn fallback(&self, message: &str, business: &BusinessProcess, available: &[String]) -> ToolDecision {
        let required: Vec<String> = business
            .required_tools
            .iter()
            .filter(|t| available.contains(t))
            .cloned()
            .collect();
        if !required.is_empty() {
            return ToolDecision {
                decision: Decision::UseTools,
                confidence: 0.5,
                tools_needed: required,
                rationale: "Fallback used: LLM decision unavailable; business process requires tools".to_string(),
                override_source: OverrideSource::Business,
            };
        }

        let mut keyword_tools: Vec<String> = Vec::new();
        for trigger in self.fallback_triggers.iter().filter(|t| t.matches(message)) {
            if available.contains(&trigger.tool) && !keyword_tools.contains(&trigger.tool) {
                keyword_tools.push(trigger.tool.clone());
            }
        }
        if !keyword_tools.is_empty() {
            return ToolDecision {
                decision: Decision::UseTools,
                confidence: 0.5,
                tools_needed: keyword_tools,
                rationale: "Fallback used: LLM decision unavailable; fallback keyword matched".to_string(),
                override_source: OverrideSource::None,
            };
        }

        let mut decision =
            ToolDecision::no_tools("Fallback used: LLM decision unavailable; no tool trigger matched");
        decision.confidence = 0.5;
        decision
    }

    /// 第 1 层：安全覆盖
    fn apply_safety(
        &self,
        mut decision: ToolDecision,
        message: &str,
        available: &[String],
        errors: &mut Vec<OrchestrationError>,
    ) -> ToolDecision {
        let Some(trigger) = self.safety_triggers.iter().find(|t| t.matches(message)) else {
            return decision;
        };
        if !available.contains(&trigger.tool) {
            tracing::warn!(tool = %trigger.tool, "safety override tool is not registered");
            errors.push(OrchestrationError::ToolResolution(trigger.tool.clone()));
            return decision;
        }

        let mut tools = vec![trigger.tool.clone()];
        if decision.uses_tools() {
            tools.extend(
                decision
                    .tools_needed
                    .drain(..)
                    .filter(|t| *t != trigger.tool),
            );
        }
        tracing::warn!(tool = %trigger.tool, "safety override fired");
        ToolDecision {
            decision: Decision::UseTools,
            confidence: 1.0,
            tools_needed: tools,
            rationale: format!("Safety override: message matched a safety keyword for '{}'", trigger.tool),
            override_source: OverrideSource::Safety,
        }
    }
}

/// 第 2 层：业务流程要求的工具未被主决策覆盖时补齐
fn apply_business(
    decision: ToolDecision,
    business: &BusinessProcess,
    available: &[String],
    errors: &mut Vec<OrchestrationError>,
) -> ToolDecision {
    if business.required_tools.is_empty() {
        return decision;
    }
    let required = filter_known(business.required_tools.clone(), available, errors);
    if required.is_empty() {
        return decision;
    }

    let missing: Vec<String> = required
        .iter()
        .filter(|t| !decision.uses_tools() || !decision.tools_needed.contains(t))
        .cloned()
        .collect();
    if missing.is_empty() {
        return decision;
    }

    let mut tools = if decision.uses_tools() {
        decision.tools_needed.clone()
    } else {
        Vec::new()
    };
    tools.extend(missing);
    ToolDecision {
        decision: Decision::UseTools,
        confidence: decision.confidence.max(0.8),
        tools_needed: tools,
        rationale: format!(
            "Business override: process '{}' requires tools ({})",
            business.process_type.as_str(),
            decision.rationale
        ),
        override_source: OverrideSource::Business,
    }
}

/// 过滤未注册的工具名（每个未知名记一条 ToolResolution），并去重
fn filter_known(
    names: Vec<String>,
    available: &[String],
    errors: &mut Vec<OrchestrationError>,
) -> Vec<String> {
    let mut known = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_string();
        if available.contains(&name) {
            if !known.contains(&name) {
                known.push(name);
            }
        } else {
            tracing::warn!(tool = %name, "decision named an unknown tool, dropping it");
            errors.push(OrchestrationError::ToolResolution(name));
        }
    }
    known
}

fn sanitize_confidence(c: f32) -> f32 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

pub fn default_safety_triggers() -> Vec<KeywordTrigger> {
    vec![KeywordTrigger::new(
        EMERGENCY_TOOL_NAME,
        &[
            "suicide",
            "suicidal",
            "kill myself",
            "end my life",
            "hurt myself",
            "self-harm",
            "self harm",
            "want to die",
            "suicidarme",
            "quitarme la vida",
        ],
    )]
}

pub fn default_fallback_triggers() -> Vec<KeywordTrigger> {
    vec![
        KeywordTrigger::new(
            SURVEY_TOOL_NAME,
            &["survey", "questionnaire", "poll", "encuesta", "cuestionario"],
        ),
        KeywordTrigger::new(CV_TOOL_NAME, &["cv", "resume", "résumé", "curriculum"]),
        KeywordTrigger::new(
            FINANCE_TOOL_NAME,
            &["calculate", "how much will", "future value", "calcular"],
        ),
    ]
}
