//! 编排运行时：进程级的不可变依赖容器
//!
//! LLM 客户端、两个知识源、工具注册表 / 执行器、护栏、业务分类器、检查点存储与配置快照
//! 在进程启动时构建一次，之后以 `&OrchestratorRuntime` 传入每次 `process_message`，并发轮次只读共享。
//! 每轮唯一可变的是它自己的 ConversationTurnState。

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_config, AppConfig, OrchestrationConfig};
use crate::core::checkpoint::{create_checkpoint_store, CheckpointStore, InMemoryCheckpointStore};
use crate::guardrails::{Guardrail, GuardrailGate, PolicyGuardrail};
use crate::llm::{CompletionOptions, LlmClient, MockLlmClient, OpenAiClient};
use crate::retrieval::{InMemoryVectorStore, KnowledgeSource, RetrievalService, VectorStore};
use crate::routing::{BusinessProcessClassifier, RoutingDecider};
use crate::tools::{default_registry, KeywordTrigger, ToolDecisionEngine, ToolExecutor, ToolRegistry};

/// 按配置选择 LLM 后端：provider = "mock" 或缺少 OPENAI_API_KEY 时使用 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();

    match (provider.as_str(), api_key) {
        ("mock", _) => {
            tracing::info!("Using Mock LLM (configured)");
            Arc::new(MockLlmClient)
        }
        (_, Some(key)) => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                Some(&key),
                cfg.llm.request_timeout_secs,
            ))
        }
        (_, None) => {
            tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

pub struct OrchestratorRuntime {
    pub(crate) config: OrchestrationConfig,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) router: RoutingDecider,
    pub(crate) classifier: BusinessProcessClassifier,
    pub(crate) retrieval: RetrievalService,
    pub(crate) decision_engine: ToolDecisionEngine,
    pub(crate) executor: ToolExecutor,
    pub(crate) gate: GuardrailGate,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
}

impl OrchestratorRuntime {
    pub fn builder(llm: Arc<dyn LlmClient>) -> RuntimeBuilder {
        RuntimeBuilder::new(llm)
    }

    /// 从配置文件 + 环境变量构建（知识库使用内存向量库）
    pub async fn from_config(config_path: Option<PathBuf>) -> Result<Self, config::ConfigError> {
        let cfg = load_config(config_path)?;
        let llm = create_llm_from_config(&cfg);
        let checkpoints = create_checkpoint_store(cfg.app.checkpoint_db.as_deref()).await;
        Ok(RuntimeBuilder::new(llm)
            .with_app_config(&cfg)
            .with_checkpoint_store(checkpoints)
            .build())
    }

    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    pub(crate) fn completion_options(config: &OrchestrationConfig) -> CompletionOptions {
        CompletionOptions {
            temperature: config.temperature,
        }
    }
}

/// 运行时构建器；未设置的依赖使用内存 / 内置默认实现
pub struct RuntimeBuilder {
    llm: Arc<dyn LlmClient>,
    config: OrchestrationConfig,
    conversation_store: Option<Arc<dyn VectorStore>>,
    global_store: Option<Arc<dyn VectorStore>>,
    registry: Option<ToolRegistry>,
    guardrail: Option<Arc<dyn Guardrail>>,
    guardrails_enabled: bool,
    classifier: Option<BusinessProcessClassifier>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    rag_keywords: Vec<String>,
    routing_use_llm: bool,
    safety_triggers: Option<Vec<KeywordTrigger>>,
}

impl RuntimeBuilder {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        let defaults = AppConfig::default();
        Self {
            llm,
            config: OrchestrationConfig::from_app(&defaults),
            conversation_store: None,
            global_store: None,
            registry: None,
            guardrail: None,
            guardrails_enabled: defaults.guardrails.enabled,
            classifier: None,
            checkpoints: None,
            rag_keywords: defaults.routing.rag_keywords,
            routing_use_llm: defaults.routing.use_llm,
            safety_triggers: None,
        }
    }

    /// 应用完整的应用配置（编排参数、路由关键词、护栏词表、业务规则文件）
    pub fn with_app_config(mut self, cfg: &AppConfig) -> Self {
        self.config = OrchestrationConfig::from_app(cfg);
        self.rag_keywords = cfg.routing.rag_keywords.clone();
        self.routing_use_llm = cfg.routing.use_llm;
        self.guardrails_enabled = cfg.guardrails.enabled;
        self.guardrail = Some(Arc::new(PolicyGuardrail::from_config(&cfg.guardrails)));
        self.classifier = Some(BusinessProcessClassifier::load_or_default(
            cfg.business.rules_path.as_deref(),
        ));
        self
    }

    pub fn with_config(mut self, config: OrchestrationConfig) -> Self {
        self.config = config;
        self
    }

    /// 两个知识源共用同一个向量库（集合名区分作用域）
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.conversation_store = Some(store.clone());
        self.global_store = Some(store);
        self
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.conversation_store = Some(store);
        self
    }

    pub fn with_global_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.global_store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrail = Some(guardrail);
        self.guardrails_enabled = true;
        self
    }

    pub fn with_classifier(mut self, classifier: BusinessProcessClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_rag_keywords(mut self, keywords: Vec<String>) -> Self {
        self.rag_keywords = keywords;
        self
    }

    pub fn with_llm_routing(mut self, enabled: bool) -> Self {
        self.routing_use_llm = enabled;
        self
    }

    pub fn with_safety_triggers(mut self, triggers: Vec<KeywordTrigger>) -> Self {
        self.safety_triggers = Some(triggers);
        self
    }

    pub fn build(self) -> OrchestratorRuntime {
        let shared_store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let conversation_store = self.conversation_store.unwrap_or_else(|| shared_store.clone());
        let global_store = self.global_store.unwrap_or(shared_store);
        let retrieval = RetrievalService::new(
            KnowledgeSource::conversation(conversation_store),
            KnowledgeSource::global(global_store, self.config.global_collection.clone()),
        );

        let registry = Arc::new(self.registry.unwrap_or_else(default_registry));
        let executor = ToolExecutor::new(
            registry,
            self.config.tool_timeout,
            self.config.max_tool_iterations,
        );

        let guardrail = self
            .guardrail
            .unwrap_or_else(|| Arc::new(PolicyGuardrail::default()));
        let gate = if self.guardrails_enabled {
            GuardrailGate::new(guardrail)
        } else {
            GuardrailGate::disabled(guardrail)
        };

        let mut decision_engine = ToolDecisionEngine::new(self.llm.clone());
        if let Some(triggers) = self.safety_triggers {
            decision_engine = decision_engine.with_safety_triggers(triggers);
        }

        OrchestratorRuntime {
            router: RoutingDecider::new(self.llm.clone(), self.rag_keywords).with_llm(self.routing_use_llm),
            classifier: self.classifier.unwrap_or_default(),
            retrieval,
            decision_engine,
            executor,
            gate,
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            llm: self.llm,
            config: self.config,
        }
    }
}
