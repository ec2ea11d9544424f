//! 上下文合并
//!
//! 会话知识库的文本永远排在全局知识库之前（顺序由来源身份决定，与完成先后无关），每块带来源标签。
//! 跨来源去重：同一段文本只保留先出现（会话优先）的一份。
//! 超出字符预算的片段不写入 prompt，但仍在 source_breakdown 中保留出处与分数。

use std::collections::HashSet;

use serde::Serialize;

use crate::core::{RetrievedChunk, SourceKb};

const CONVERSATION_HEADER: &str = "[Conversation documents]";
const GLOBAL_HEADER: &str = "[Global knowledge]";

/// 单个片段的出处记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRecord {
    pub source_kb: SourceKb,
    pub provenance_id: String,
    pub score: f32,
    /// 是否写入了 merged text（重复或超预算时为 false）
    pub rendered: bool,
}

/// 合并结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergedContext {
    /// 空字符串表示"本轮未使用 RAG"
    pub text: String,
    pub source_breakdown: Vec<SourceRecord>,
}

impl MergedContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn rendered_count(&self, kb: SourceKb) -> usize {
        self.source_breakdown
            .iter()
            .filter(|r| r.source_kb == kb && r.rendered)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ContextMerger {
    max_chars: usize,
}

impl Default for ContextMerger {
    fn default() -> Self {
        Self::new(6000)
    }
}

impl ContextMerger {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// `merge(conversationResults, globalResults) -> mergedContext, sourceBreakdown`
    pub fn merge(&self, conversation: &[RetrievedChunk], global: &[RetrievedChunk]) -> MergedContext {
        let mut seen: HashSet<String> = HashSet::new();
        let mut breakdown = Vec::with_capacity(conversation.len() + global.len());
        let mut used = 0usize;
        let mut blocks: Vec<String> = Vec::new();

        for (header, chunks) in [(CONVERSATION_HEADER, conversation), (GLOBAL_HEADER, global)] {
            let mut lines: Vec<String> = Vec::new();
            for chunk in chunks {
                let key = dedupe_key(&chunk.text);
                let fresh = !key.is_empty() && seen.insert(key);
                let cost = chunk.text.chars().count();
                let fits = used + cost <= self.max_chars;
                let rendered = fresh && fits;
                if rendered {
                    used += cost;
                    lines.push(format!("({}) {}", lines.len() + 1, chunk.text.trim()));
                }
                breakdown.push(SourceRecord {
                    source_kb: chunk.source_kb,
                    provenance_id: chunk.provenance_id.clone(),
                    score: chunk.score,
                    rendered,
                });
            }
            if !lines.is_empty() {
                blocks.push(format!("{header}\n{}", lines.join("\n")));
            }
        }

        MergedContext {
            text: blocks.join("\n\n"),
            source_breakdown: breakdown,
        }
    }
}

fn dedupe_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
