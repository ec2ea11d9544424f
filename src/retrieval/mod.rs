//! 双知识库检索
//!
//! RetrievalService 串起 QueryOptimizer → KnowledgeSource×2（并发）→ ContextMerger。
//! 两个知识源互不依赖，用 `tokio::join!` 并发检索，每个知识源内部的多条查询用 `join_all` 并发；
//! 合并顺序只由来源身份决定（会话在前、全局在后）。
//! 单个知识源失败不会中断本轮：记为 RetrievalDegraded，用另一侧（或空）上下文继续。

pub mod knowledge;
pub mod merger;
pub mod optimizer;

use std::collections::HashMap;

use futures_util::future::join_all;

pub use knowledge::{
    conversation_collection, InMemoryVectorStore, KnowledgeError, KnowledgeSource, SearchHit,
    VectorStore,
};
pub use merger::{ContextMerger, MergedContext, SourceRecord};
pub use optimizer::{QueryIntent, QueryOptimizer};

use crate::core::{OrchestrationError, RetrievedChunk, SourceKb};
use crate::memory::Message;

/// 单轮检索参数（来自 OrchestrationConfig，可被单轮覆盖）
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub score_threshold: f32,
    pub max_queries: usize,
    pub max_context_chars: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.1,
            max_queries: 3,
            max_context_chars: 6000,
        }
    }
}

/// 检索结果
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub queries: Vec<String>,
    /// 会话片段在前，全局片段在后
    pub chunks: Vec<RetrievedChunk>,
    pub merged: MergedContext,
    pub errors: Vec<OrchestrationError>,
}

/// 单个知识源的检索结果（多条查询合并后）
#[derive(Debug, Default)]
struct SourceResult {
    chunks: Vec<RetrievedChunk>,
    failures: Vec<String>,
}

pub struct RetrievalService {
    conversation: KnowledgeSource,
    global: KnowledgeSource,
    optimizer: QueryOptimizer,
}

impl RetrievalService {
    pub fn new(conversation: KnowledgeSource, global: KnowledgeSource) -> Self {
        Self {
            conversation,
            global,
            optimizer: QueryOptimizer::default(),
        }
    }

    pub fn conversation_source(&self) -> &KnowledgeSource {
        &self.conversation
    }

    pub fn global_source(&self) -> &KnowledgeSource {
        &self.global
    }

    pub async fn retrieve(
        &self,
        message: &str,
        recent_context: &[Message],
        conversation_id: Option<&str>,
        params: &RetrievalParams,
    ) -> RetrievalOutcome {
        let queries = self
            .optimizer
            .optimize_with_limit(message, recent_context, params.max_queries);
        if queries.is_empty() {
            return RetrievalOutcome::default();
        }

        let (conv, global) = tokio::join!(
            search_all(&self.conversation, &queries, conversation_id, params),
            search_all(&self.global, &queries, conversation_id, params),
        );

        let mut errors = Vec::new();
        for (kb, result) in [(SourceKb::Conversation, &conv), (SourceKb::Global, &global)] {
            if !result.failures.is_empty() {
                tracing::warn!(kb = kb.label(), failures = ?result.failures, "knowledge source failed");
                errors.push(OrchestrationError::RetrievalDegraded(format!(
                    "{} knowledge base: {}",
                    kb.label(),
                    result.failures.join("; ")
                )));
            }
        }
        if conv.chunks.is_empty() && global.chunks.is_empty() && errors.is_empty() {
            errors.push(OrchestrationError::RetrievalDegraded(
                "no results from either knowledge base".to_string(),
            ));
        }

        let merged = ContextMerger::new(params.max_context_chars).merge(&conv.chunks, &global.chunks);
        tracing::info!(
            queries = queries.len(),
            conversation_hits = conv.chunks.len(),
            global_hits = global.chunks.len(),
            "retrieval finished"
        );

        let mut chunks = conv.chunks;
        chunks.extend(global.chunks);
        RetrievalOutcome {
            queries,
            chunks,
            merged,
            errors,
        }
    }
}

/// 对一个知识源并发执行全部查询；按出处 ID 去重（保留最高分），分数降序，截断到 top_k
async fn search_all(
    source: &KnowledgeSource,
    queries: &[String],
    conversation_id: Option<&str>,
    params: &RetrievalParams,
) -> SourceResult {
    let futures = queries
        .iter()
        .map(|q| source.search(q, conversation_id, params.top_k, params.score_threshold));
    let results = join_all(futures).await;

    let mut best: HashMap<String, RetrievedChunk> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(chunks) => {
                for chunk in chunks {
                    match best.get(&chunk.provenance_id) {
                        Some(existing) if existing.score >= chunk.score => {}
                        Some(_) => {
                            best.insert(chunk.provenance_id.clone(), chunk);
                        }
                        None => {
                            order.push(chunk.provenance_id.clone());
                            best.insert(chunk.provenance_id.clone(), chunk);
                        }
                    }
                }
            }
            Err(e) => failures.push(e.to_string()),
        }
    }

    let mut chunks: Vec<RetrievedChunk> = order.into_iter().filter_map(|id| best.remove(&id)).collect();
    chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    chunks.truncate(params.top_k);
    SourceResult { chunks, failures }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    /// 每次检索随机延迟后返回固定命中
    struct DelayedStore {
        max_delay_ms: u64,
        text: &'static str,
    }

    #[async_trait]
    impl VectorStore for DelayedStore {
        async fn search(
            &self,
            collection: &str,
            _query: &str,
            _top_k: usize,
            _threshold: f32,
        ) -> Result<Vec<SearchHit>, KnowledgeError> {
            let jitter = u64::from(uuid::Uuid::new_v4().as_bytes()[0]) % (self.max_delay_ms + 1);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            Ok(vec![SearchHit {
                id: format!("{collection}-doc"),
                text: self.text.to_string(),
                score: 0.8,
                metadata: HashMap::new(),
            }])
        }
    }

    struct DownStore;

    #[async_trait]
    impl VectorStore for DownStore {
        async fn search(&self, _: &str, _: &str, _: usize, _: f32) -> Result<Vec<SearchHit>, KnowledgeError> {
            Err(KnowledgeError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_merge_order_ignores_completion_order() {
        for _ in 0..20 {
            let service = RetrievalService::new(
                KnowledgeSource::conversation(Arc::new(DelayedStore {
                    max_delay_ms: 15,
                    text: "conversation fact",
                })),
                KnowledgeSource::global(
                    Arc::new(DelayedStore {
                        max_delay_ms: 15,
                        text: "global fact",
                    }),
                    "global_knowledge",
                ),
            );
            let out = service
                .retrieve("what is compound interest", &[], Some("c1"), &RetrievalParams::default())
                .await;
            let text = &out.merged.text;
            assert!(text.find("conversation fact").unwrap() < text.find("global fact").unwrap());
            assert_eq!(out.chunks[0].source_kb, SourceKb::Conversation);
            assert!(out.errors.is_empty());
        }
    }

    #[tokio::test]
    async fn test_one_failed_source_degrades() {
        let service = RetrievalService::new(
            KnowledgeSource::conversation(Arc::new(DownStore)),
            KnowledgeSource::global(
                Arc::new(DelayedStore {
                    max_delay_ms: 0,
                    text: "global fact",
                }),
                "global_knowledge",
            ),
        );
        let out = service
            .retrieve("budget tips", &[], Some("c1"), &RetrievalParams::default())
            .await;
        assert!(out.merged.text.contains("global fact"));
        assert!(matches!(&out.errors[0], OrchestrationError::RetrievalDegraded(m) if m.contains("conversation")));
    }

    #[tokio::test]
    async fn test_duplicate_hits_across_queries_are_collapsed() {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .add_document("global_knowledge", "g1", "Compound interest is interest earned on interest.")
            .await;
        let service = RetrievalService::new(
            KnowledgeSource::conversation(store.clone()),
            KnowledgeSource::global(store, "global_knowledge"),
        );
        let out = service
            .retrieve("What is compound interest?", &[], None, &RetrievalParams::default())
            .await;
        assert_eq!(out.queries.len(), 3);
        assert_eq!(out.chunks.len(), 1);
        assert!(out.merged.text.contains("[Global knowledge]"));
    }

    #[tokio::test]
    async fn test_empty_everywhere_is_recorded() {
        let store = Arc::new(InMemoryVectorStore::new());
        let service = RetrievalService::new(
            KnowledgeSource::conversation(store.clone()),
            KnowledgeSource::global(store, "global_knowledge"),
        );
        let out = service
            .retrieve("inflation", &[], Some("c9"), &RetrievalParams::default())
            .await;
        assert!(out.merged.is_empty());
        assert_eq!(out.errors.len(), 1);
    }
}
