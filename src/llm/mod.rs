//! LLM 层：客户端抽象、结构化输出、OpenAI 兼容实现与 Mock

pub mod mock;
pub mod openai;
pub mod structured;
pub mod traits;

pub use mock::{system_prompt_of, MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use structured::{extract_json_block, invoke_structured, schema_json};
pub use traits::{CompletionOptions, LlmClient, LlmError};
