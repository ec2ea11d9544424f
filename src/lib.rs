//! Hive - 对话智能体编排核心
//!
//! 每条用户消息走一遍有界状态机：输入护栏 → 业务流程分类 → RAG / Agent 路由 →
//! 双知识库检索 → 工具决策 → 工具循环 → 输出护栏，最终返回回复与可观测元数据。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与单轮覆盖
//! - **core**: 单轮状态、错误分类、检查点、状态机、运行时与 `process_message`
//! - **guardrails**: 输入 / 输出安全护栏与处置策略
//! - **llm**: LLM 客户端抽象、结构化输出、OpenAI 兼容实现与 Mock
//! - **memory**: 对话消息、历史承接、分词
//! - **observability**: tracing 初始化
//! - **retrieval**: 查询优化、知识源、上下文合并
//! - **routing**: 路由决策与业务流程分类
//! - **tools**: 工具注册表、执行器、工具决策与内置工具

pub mod config;
pub mod core;
pub mod guardrails;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod retrieval;
pub mod routing;
pub mod tools;

pub use crate::config::{load_config, AppConfig, ConfigOverride, OrchestrationConfig};
pub use crate::core::{
    process_message, OrchestrationError, OrchestratorRuntime, RuntimeBuilder, TurnMetadata,
    TurnOutcome, TurnReply,
};
