//! 业务流程分类
//!
//! 分类分三步：
//! 1. 关键词匹配各流程的触发词，命中数最多者胜出（平分取先声明者），无命中为 general
//! 2. 覆盖关键词集：高价值关键词（问卷 / 简历）在分类之后强制流程类型，覆盖永远最后执行
//! 3. 对选中流程的规则逐条求值，命中规则按优先级降序稳定排序，汇总 require_tools 动作得到必需工具
//!
//! 规则条件是封闭的类型化谓词集合（KeywordPresent / ThresholdBelow / FlagEquals），
//! 对扁平上下文求值，没有任何运行时表达式执行。规则可从 TOML 文件加载。

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::core::{BusinessProcess, ProcessType};
use crate::memory::tokenizer::contains_keyword;
use crate::tools::{CV_TOOL_NAME, FINANCE_TOOL_NAME, SURVEY_TOOL_NAME};

/// 规则文件加载错误
#[derive(Error, Debug)]
pub enum RuleLoadError {
    #[error("failed to read rule file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse rule file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid rule set: {0}")]
    Invalid(String),
}

/// 规则求值上下文：文本字段、数值字段、布尔标志
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleContext {
    pub text: HashMap<String, String>,
    pub numbers: HashMap<String, f64>,
    pub flags: HashMap<String, bool>,
}

impl RuleContext {
    /// 由消息构造：`message` 文本、`word_count` / `message_length` 数值
    pub fn from_message(message: &str) -> Self {
        let mut ctx = Self::default();
        ctx.text.insert("message".to_string(), message.to_string());
        ctx.numbers.insert(
            "word_count".to_string(),
            message.split_whitespace().count() as f64,
        );
        ctx.numbers.insert(
            "message_length".to_string(),
            message.chars().count() as f64,
        );
        ctx
    }

    pub fn with_number(mut self, field: impl Into<String>, value: f64) -> Self {
        self.numbers.insert(field.into(), value);
        self
    }

    pub fn with_flag(mut self, field: impl Into<String>, value: bool) -> Self {
        self.flags.insert(field.into(), value);
        self
    }

    pub fn with_text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.text.insert(field.into(), value.into());
        self
    }
}

/// 类型化谓词
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// 文本字段包含任一关键词
    KeywordPresent { field: String, keywords: Vec<String> },
    /// 数值字段严格小于 value（字段缺失为假）
    ThresholdBelow { field: String, value: f64 },
    /// 布尔字段等于 value（字段缺失视为 false）
    FlagEquals { field: String, value: bool },
}

impl Predicate {
    pub fn evaluate(&self, ctx: &RuleContext) -> bool {
        match self {
            Predicate::KeywordPresent { field, keywords } => ctx
                .text
                .get(field)
                .is_some_and(|text| keywords.iter().any(|k| contains_keyword(text, k))),
            Predicate::ThresholdBelow { field, value } => {
                ctx.numbers.get(field).is_some_and(|n| n < value)
            }
            Predicate::FlagEquals { field, value } => {
                ctx.flags.get(field).copied().unwrap_or(false) == *value
            }
        }
    }
}

/// 规则命中后的动作
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// 要求本轮调用这些工具
    RequireTools { tools: Vec<String> },
    /// 仅标注（记录在 triggered_rules 中）
    Annotate,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule {
    pub name: String,
    pub condition: Predicate,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
}

/// 一个流程类型：触发词 + 规则
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessDefinition {
    #[serde(rename = "type")]
    pub process_type: ProcessType,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// 覆盖关键词集：命中即强制流程类型
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OverrideSet {
    pub process: ProcessType,
    pub keywords: Vec<String>,
}

/// TOML 规则文件结构
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    process: Vec<ProcessDefinition>,
    #[serde(default, rename = "override")]
    overrides: Vec<OverrideSet>,
}

#[derive(Debug, Clone)]
pub struct BusinessProcessClassifier {
    processes: Vec<ProcessDefinition>,
    overrides: Vec<OverrideSet>,
}

impl Default for BusinessProcessClassifier {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            overrides: default_overrides(),
        }
    }
}

impl BusinessProcessClassifier {
    pub fn new(processes: Vec<ProcessDefinition>, overrides: Vec<OverrideSet>) -> Result<Self, RuleLoadError> {
        validate(&processes)?;
        Ok(Self { processes, overrides })
    }

    /// 从 TOML 字符串加载
    pub fn from_toml_str(s: &str) -> Result<Self, RuleLoadError> {
        let file: RuleFile = toml::from_str(s)?;
        Self::new(file.process, file.overrides)
    }

    pub fn from_file(path: &Path) -> Result<Self, RuleLoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 有路径时尝试加载，失败则记录并回退到内置规则
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        match Self::from_file(path) {
            Ok(classifier) => {
                tracing::info!(path = %path.display(), processes = classifier.processes.len(), "business rules loaded");
                classifier
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load business rules, using built-in rules");
                Self::default()
            }
        }
    }

    /// `classify(message, context) -> {type, rules, requiredTools}`
    pub fn classify(&self, message: &str, ctx: &RuleContext) -> BusinessProcess {
        let primary = self.primary_match(message);
        let process_type = self.apply_overrides(message).unwrap_or(primary);
        if process_type != primary {
            tracing::info!(from = primary.as_str(), to = process_type.as_str(), "business process override applied");
        }

        let Some(definition) = self.processes.iter().find(|p| p.process_type == process_type) else {
            return BusinessProcess {
                process_type,
                triggered_rules: Vec::new(),
                required_tools: Vec::new(),
            };
        };

        let mut triggered: Vec<&Rule> = definition
            .rules
            .iter()
            .filter(|r| r.condition.evaluate(ctx))
            .collect();
        // sort_by 是稳定排序：同优先级保持声明顺序
        triggered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut required_tools: Vec<String> = Vec::new();
        for rule in &triggered {
            if let RuleAction::RequireTools { tools } = &rule.action {
                for tool in tools {
                    if !required_tools.contains(tool) {
                        required_tools.push(tool.clone());
                    }
                }
            }
        }

        let result = BusinessProcess {
            process_type,
            triggered_rules: triggered.iter().map(|r| r.name.clone()).collect(),
            required_tools,
        };
        tracing::info!(
            process = result.process_type.as_str(),
            rules = ?result.triggered_rules,
            required_tools = ?result.required_tools,
            "business process classified"
        );
        result
    }

    fn primary_match(&self, message: &str) -> ProcessType {
        let mut best: Option<(ProcessType, usize)> = None;
        for def in &self.processes {
            let hits = def
                .triggers
                .iter()
                .filter(|t| contains_keyword(message, t))
                .count();
            if hits > 0 && best.map_or(true, |(_, b)| hits > b) {
                best = Some((def.process_type, hits));
            }
        }
        best.map_or(ProcessType::General, |(t, _)| t)
    }

    fn apply_overrides(&self, message: &str) -> Option<ProcessType> {
        self.overrides
            .iter()
            .find(|o| o.keywords.iter().any(|k| contains_keyword(message, k)))
            .map(|o| o.process)
    }
}

fn validate(processes: &[ProcessDefinition]) -> Result<(), RuleLoadError> {
    let mut seen = Vec::new();
    for def in processes {
        if seen.contains(&def.process_type) {
            return Err(RuleLoadError::Invalid(format!(
                "process '{}' is defined more than once",
                def.process_type.as_str()
            )));
        }
        seen.push(def.process_type);
        if let Some(rule) = def.rules.iter().find(|r| r.name.trim().is_empty()) {
            return Err(RuleLoadError::Invalid(format!(
                "process '{}' has a rule without a name (priority {})",
                def.process_type.as_str(),
                rule.priority
            )));
        }
    }
    Ok(())
}

fn words(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

fn keyword_rule(name: &str, keywords: &[&str], action: RuleAction, priority: i32) -> Rule {
    Rule {
        name: name.to_string(),
        condition: Predicate::KeywordPresent {
            field: "message".to_string(),
            keywords: words(keywords),
        },
        action,
        priority,
    }
}

const SURVEY_KEYWORDS: &[&str] = &[
    "survey", "questionnaire", "poll", "create a survey", "encuesta", "cuestionario",
];
const CV_KEYWORDS: &[&str] = &["cv", "resume", "résumé", "curriculum", "hoja de vida"];

/// 内置流程：survey_generation / cv_analysis / financial_advice / general
pub fn default_processes() -> Vec<ProcessDefinition> {
    vec![
        ProcessDefinition {
            process_type: ProcessType::SurveyGeneration,
            triggers: words(SURVEY_KEYWORDS),
            rules: vec![
                keyword_rule(
                    "survey_request",
                    SURVEY_KEYWORDS,
                    RuleAction::RequireTools {
                        tools: vec![SURVEY_TOOL_NAME.to_string()],
                    },
                    10,
                ),
                Rule {
                    name: "survey_brief_too_short".to_string(),
                    condition: Predicate::ThresholdBelow {
                        field: "word_count".to_string(),
                        value: 4.0,
                    },
                    action: RuleAction::Annotate,
                    priority: 1,
                },
            ],
        },
        ProcessDefinition {
            process_type: ProcessType::CvAnalysis,
            triggers: words(CV_KEYWORDS),
            rules: vec![
                keyword_rule(
                    "cv_review",
                    CV_KEYWORDS,
                    RuleAction::RequireTools {
                        tools: vec![CV_TOOL_NAME.to_string()],
                    },
                    10,
                ),
                Rule {
                    name: "cv_without_conversation".to_string(),
                    condition: Predicate::FlagEquals {
                        field: "has_conversation".to_string(),
                        value: false,
                    },
                    action: RuleAction::Annotate,
                    priority: 5,
                },
            ],
        },
        ProcessDefinition {
            process_type: ProcessType::FinancialAdvice,
            triggers: words(&[
                "interest", "savings", "budget", "loan", "mortgage", "investment", "invest",
                "inflation", "debt", "retirement", "interés", "ahorro", "préstamo", "inversión",
            ]),
            rules: vec![
                keyword_rule(
                    "calculation_request",
                    &["calculate", "how much will", "future value", "at %", "calcular", "cuánto"],
                    RuleAction::RequireTools {
                        tools: vec![FINANCE_TOOL_NAME.to_string()],
                    },
                    10,
                ),
                keyword_rule(
                    "financial_education",
                    &["what is", "explain", "qué es"],
                    RuleAction::Annotate,
                    1,
                ),
            ],
        },
        ProcessDefinition {
            process_type: ProcessType::General,
            triggers: Vec::new(),
            rules: Vec::new(),
        },
    ]
}

/// 覆盖关键词集（问卷 / 简历）
pub fn default_overrides() -> Vec<OverrideSet> {
    vec![
        OverrideSet {
            process: ProcessType::SurveyGeneration,
            keywords: words(&["create a survey", "make a survey", "crea una encuesta"]),
        },
        OverrideSet {
            process: ProcessType::CvAnalysis,
            keywords: words(&["analyze my cv", "review my cv", "analyze my resume", "review my resume"]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let ctx = RuleContext::from_message("Create a survey").with_flag("vip", true);
        assert!(Predicate::KeywordPresent {
            field: "message".into(),
            keywords: vec!["survey".into()]
        }
        .evaluate(&ctx));
        assert!(Predicate::ThresholdBelow {
            field: "word_count".into(),
            value: 4.0
        }
        .evaluate(&ctx));
        assert!(!Predicate::ThresholdBelow {
            field: "missing".into(),
            value: 4.0
        }
        .evaluate(&ctx));
        assert!(Predicate::FlagEquals {
            field: "vip".into(),
            value: true
        }
        .evaluate(&ctx));
        assert!(Predicate::FlagEquals {
            field: "absent".into(),
            value: false
        }
        .evaluate(&ctx));
    }

    #[test]
    fn test_survey_requires_survey_tool() {
        let msg = "create a survey";
        let bp = BusinessProcessClassifier::default().classify(msg, &RuleContext::from_message(msg));
        assert_eq!(bp.process_type, ProcessType::SurveyGeneration);
        assert_eq!(bp.required_tools, vec![SURVEY_TOOL_NAME.to_string()]);
        assert_eq!(bp.triggered_rules, vec!["survey_request", "survey_brief_too_short"]);
    }

    #[test]
    fn test_no_match_is_general() {
        let bp = BusinessProcessClassifier::default().classify("Hello", &RuleContext::from_message("Hello"));
        assert_eq!(bp, BusinessProcess::general());
    }

    #[test]
    fn test_override_wins_over_primary_match() {
        // 理财词命中更多，但 "review my cv" 覆盖为简历分析
        let msg = "review my cv for a loan officer role in investment and mortgage";
        let bp = BusinessProcessClassifier::default().classify(msg, &RuleContext::from_message(msg));
        assert_eq!(bp.process_type, ProcessType::CvAnalysis);
        assert!(bp.required_tools.contains(&CV_TOOL_NAME.to_string()));
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let toml = r#"
[[process]]
type = "general"
triggers = ["hello"]

[[process.rules]]
name = "first"
priority = 5
action = { type = "annotate" }
condition = { type = "keyword_present", field = "message", keywords = ["hello"] }

[[process.rules]]
name = "top"
priority = 9
action = { type = "require_tools", tools = ["echo"] }
condition = { type = "flag_equals", field = "debug", value = true }

[[process.rules]]
name = "second"
priority = 5
action = { type = "annotate" }
condition = { type = "threshold_below", field = "word_count", value = 10.0 }
"#;
        let classifier = BusinessProcessClassifier::from_toml_str(toml).unwrap();
        let ctx = RuleContext::from_message("hello there").with_flag("debug", true);
        let bp = classifier.classify("hello there", &ctx);
        assert_eq!(bp.triggered_rules, vec!["top", "first", "second"]);
        assert_eq!(bp.required_tools, vec!["echo".to_string()]);
    }

    #[test]
    fn test_duplicate_process_is_rejected() {
        let toml = "[[process]]\ntype = \"general\"\n[[process]]\ntype = \"general\"\n";
        assert!(matches!(
            BusinessProcessClassifier::from_toml_str(toml),
            Err(RuleLoadError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file_and_fallback() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[override]]\nprocess = \"financial_advice\"\nkeywords = [\"money\"]\n\n[[process]]\ntype = \"financial_advice\"\ntriggers = [\"money\"]"
        )
        .unwrap();
        let classifier = BusinessProcessClassifier::load_or_default(Some(file.path()));
        let bp = classifier.classify("money please", &RuleContext::from_message("money please"));
        assert_eq!(bp.process_type, ProcessType::FinancialAdvice);

        let missing = BusinessProcessClassifier::load_or_default(Some(Path::new("/nonexistent/rules.toml")));
        let bp = missing.classify("create a survey", &RuleContext::from_message("create a survey"));
        assert_eq!(bp.process_type, ProcessType::SurveyGeneration);
    }

    #[test]
    fn test_shipped_rules_match_builtin() {
        let shipped =
            BusinessProcessClassifier::from_toml_str(include_str!("../../config/business_rules.toml")).unwrap();
        let builtin = BusinessProcessClassifier::default();
        for msg in [
            "Please create a survey about coffee",
            "Can you review my CV?",
            "Calculate interest on my savings",
            "Hello there",
        ] {
            let ctx = RuleContext::from_message(msg).with_flag("has_conversation", true);
            assert_eq!(shipped.classify(msg, &ctx), builtin.classify(msg, &ctx), "{msg}");
        }
    }
}
