//! 结构化输出调用
//!
//! 用 schemars 为目标类型生成 JSON Schema，拼入 system prompt，再从回复中提取第一个 JSON 对象反序列化。
//! 支持 ```json 围栏与裸 JSON 两种形式。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;

use crate::llm::{CompletionOptions, LlmClient, LlmError};
use crate::memory::Message;

/// 从文本中提取 JSON 片段（```json 围栏优先，其次首个 '{' 到最后一个 '}'）
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 生成目标类型的 Schema 字符串
pub fn schema_json<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 结构化调用：`invoke(systemPrompt, messages, responseSchema) -> schemaInstance`
pub async fn invoke_structured<T>(
    llm: &dyn LlmClient,
    system_prompt: &str,
    messages: &[Message],
    options: &CompletionOptions,
) -> Result<T, LlmError>
where
    T: DeserializeOwned + JsonSchema,
{
    let system = format!(
        "{}\n\nRespond ONLY with a single JSON object matching this JSON Schema, no prose:\n{}",
        system_prompt,
        schema_json::<T>()
    );
    let mut full = Vec::with_capacity(messages.len() + 1);
    full.push(Message::system(system));
    full.extend_from_slice(messages);

    let raw = llm.complete(&full, options).await?;
    if raw.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    let json = extract_json_block(&raw)
        .ok_or_else(|| LlmError::InvalidStructuredOutput(format!("no JSON object in: {raw}")))?;
    serde_json::from_str(json).map_err(|e| LlmError::InvalidStructuredOutput(format!("{e}: {json}")))
}
