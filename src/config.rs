//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATION__MAX_TOOL_ITERATIONS=2`）。
//! 编排开始时把 AppConfig 折叠为不可变的 OrchestrationConfig；单轮可用 ConfigOverride 在副本上覆盖。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestration: OrchestrationSection,
    pub retrieval: RetrievalSection,
    pub routing: RoutingSection,
    pub guardrails: GuardrailsSection,
    pub business: BusinessSection,
    pub messages: MessagesSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 从检查点承接的历史轮数
    pub max_context_turns: usize,
    /// SQLite 检查点文件（需 async-sqlite 特性），未设置时使用内存检查点
    pub checkpoint_db: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_context_turns: 20,
            checkpoint_db: None,
        }
    }
}

/// [llm] 段：后端选择、模型、温度与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.2,
            request_timeout_secs: 20,
        }
    }
}

/// [orchestration] 段：循环上限与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestrationSection {
    pub max_tool_iterations: u32,
    pub max_output_retries: u32,
    pub turn_timeout_secs: u64,
    /// 单次工具调用超时（秒），超时转为工具失败结果，不取消整轮
    pub tool_timeout_secs: u64,
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            max_tool_iterations: 3,
            max_output_retries: 2,
            turn_timeout_secs: 30,
            tool_timeout_secs: 15,
        }
    }
}

/// [retrieval] 段：双知识库检索参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub top_k: usize,
    pub score_threshold: f32,
    pub max_queries_per_request: usize,
    pub global_collection: String,
    /// 合并后写入 prompt 的上下文最大字符数
    pub max_context_chars: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.1,
            max_queries_per_request: 3,
            global_collection: "global_knowledge".to_string(),
            max_context_chars: 6000,
        }
    }
}

/// [routing] 段：RAG 关键词与是否调用 LLM 路由
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub use_llm: bool,
    pub rag_keywords: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            use_llm: true,
            rag_keywords: default_rag_keywords(),
        }
    }
}

fn default_rag_keywords() -> Vec<String> {
    [
        "what is", "explain", "define", "definition", "difference between", "how does",
        "interest", "compound", "savings", "budget", "loan", "mortgage", "investment", "inflation",
        "credit", "debt", "document", "uploaded", "file", "according to",
        "qué es", "explica", "interés", "ahorro", "préstamo", "inversión",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [guardrails] 段：按类别的屏蔽词（大小写不敏感子串匹配）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardrailsSection {
    pub enabled: bool,
    /// critical：立即阻断
    pub critical_terms: Vec<String>,
    /// high：阻断 / 触发重生成
    pub high_terms: Vec<String>,
    /// medium：记录后放行
    pub medium_terms: Vec<String>,
    /// 是否检测 PII（low，输出侧脱敏）
    pub detect_pii: bool,
}

impl Default for GuardrailsSection {
    fn default() -> Self {
        let to_vec = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            enabled: true,
            critical_terms: to_vec(&[
                "build a bomb",
                "make a bomb",
                "child sexual",
                "synthesize nerve agent",
            ]),
            high_terms: to_vec(&[
                "ignore previous instructions",
                "ignore all previous instructions",
                "disregard your instructions",
                "reveal your system prompt",
                "jailbreak",
                "steal credit card",
            ]),
            medium_terms: to_vec(&["idiot", "stupid", "hate you"]),
            detect_pii: true,
        }
    }
}

/// [business] 段：业务规则文件
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BusinessSection {
    /// TOML 规则文件路径；未设置或加载失败时使用内置规则
    pub rules_path: Option<PathBuf>,
}

/// [messages] 段：面向终端用户的固定文案
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MessagesSection {
    pub input_rejected: String,
    pub turn_timeout: String,
    pub output_disclaimer: String,
    pub degraded_answer: String,
    pub generation_failed: String,
}

impl Default for MessagesSection {
    fn default() -> Self {
        Self {
            input_rejected: "I'm sorry, but I can't help with that request.".to_string(),
            turn_timeout: "Sorry, this is taking longer than expected. Please try again in a moment."
                .to_string(),
            output_disclaimer: "Note: this answer may contain content that did not pass our safety review; please use it with caution."
                .to_string(),
            degraded_answer: "I couldn't complete every step needed for a full answer, so here is what I have so far."
                .to_string(),
            generation_failed: "Sorry, I couldn't generate a response right now. Please try again."
                .to_string(),
        }
    }
}

/// 编排运行时使用的不可变配置快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tool_iterations: u32,
    pub max_output_retries: u32,
    pub turn_timeout: Duration,
    pub tool_timeout: Duration,
    pub top_k: usize,
    pub score_threshold: f32,
    pub max_queries_per_request: usize,
    pub global_collection: String,
    pub max_context_chars: usize,
    pub max_context_turns: usize,
    pub messages: MessagesSection,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl OrchestrationConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm.model.clone(),
            temperature: cfg.llm.temperature,
            max_tool_iterations: cfg.orchestration.max_tool_iterations,
            max_output_retries: cfg.orchestration.max_output_retries,
            turn_timeout: Duration::from_secs(cfg.orchestration.turn_timeout_secs),
            tool_timeout: Duration::from_secs(cfg.orchestration.tool_timeout_secs),
            top_k: cfg.retrieval.top_k,
            score_threshold: cfg.retrieval.score_threshold,
            max_queries_per_request: cfg.retrieval.max_queries_per_request.max(1),
            global_collection: cfg.retrieval.global_collection.clone(),
            max_context_chars: cfg.retrieval.max_context_chars,
            max_context_turns: cfg.app.max_context_turns,
            messages: cfg.messages.clone(),
        }
    }

    /// 在副本上应用单轮覆盖
    pub fn with_override(&self, over: &ConfigOverride) -> Self {
        let mut cfg = self.clone();
        if let Some(t) = over.temperature {
            cfg.temperature = t.clamp(0.0, 2.0);
        }
        if let Some(n) = over.max_tool_iterations {
            cfg.max_tool_iterations = n;
        }
        if let Some(n) = over.max_output_retries {
            cfg.max_output_retries = n;
        }
        if let Some(secs) = over.turn_timeout_secs {
            cfg.turn_timeout = Duration::from_secs(secs);
        }
        if let Some(k) = over.top_k {
            cfg.top_k = k;
        }
        if let Some(s) = over.score_threshold {
            cfg.score_threshold = s;
        }
        if let Some(n) = over.max_queries_per_request {
            cfg.max_queries_per_request = n.max(1);
        }
        cfg
    }
}

/// 单轮配置覆盖（全部可选）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigOverride {
    pub temperature: Option<f32>,
    pub max_tool_iterations: Option<u32>,
    pub max_output_retries: Option<u32>,
    pub turn_timeout_secs: Option<u64>,
    pub top_k: Option<usize>,
    pub score_threshold: Option<f32>,
    pub max_queries_per_request: Option<usize>,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
