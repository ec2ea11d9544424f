//! 知识源
//!
//! VectorStore 是外部向量检索服务的窄接口：按集合名检索，集合不存在时返回空列表而非错误。
//! KnowledgeSource 把一个 VectorStore 绑定到一个集合作用域：
//! - 全局知识库：固定集合名（默认 "global_knowledge"）
//! - 会话知识库：集合名由会话 ID 派生（"conversation_" + conversation_id），保证文档不跨会话泄漏
//!
//! InMemoryVectorStore 用关键词覆盖率打分，供本地运行与测试使用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::{RetrievedChunk, SourceKb};
use crate::memory::tokenizer;

/// 知识源错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KnowledgeError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("search failed: {0}")]
    Search(String),
}

/// 单条检索命中
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

/// 外部向量检索服务：`search(collectionName, query, topK, scoreThreshold)`
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 返回分数不低于阈值的命中，按分数降序；集合不存在时返回 `Ok(vec![])`
    async fn search(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>, KnowledgeError>;
}

#[derive(Debug, Clone)]
struct StoredDocument {
    id: String,
    text: String,
    terms: std::collections::HashSet<String>,
    metadata: HashMap<String, String>,
}

/// 内存向量库：集合名 -> 文档列表；分数为查询词在文档中的覆盖率
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Vec<StoredDocument>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入文档（同集合内同 id 覆盖旧版本）
    pub async fn add_document(
        &self,
        collection: &str,
        id: impl Into<String>,
        text: impl Into<String>,
    ) {
        self.add_document_with_metadata(collection, id, text, HashMap::new())
            .await;
    }

    pub async fn add_document_with_metadata(
        &self,
        collection: &str,
        id: impl Into<String>,
        text: impl Into<String>,
        metadata: HashMap<String, String>,
    ) {
        let id = id.into();
        let text = text.into();
        let doc = StoredDocument {
            terms: tokenizer::content_terms(&text),
            id: id.clone(),
            text,
            metadata,
        };
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        docs.retain(|d| d.id != id);
        docs.push(doc);
    }

    pub async fn has_collection(&self, collection: &str) -> bool {
        self.collections.read().await.contains_key(collection)
    }

    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn search(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<SearchHit>, KnowledgeError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            tracing::debug!(collection, "collection does not exist, returning no hits");
            return Ok(Vec::new());
        };

        let query_terms = tokenizer::content_terms(query);
        let mut scored: Vec<(f32, &StoredDocument)> = docs
            .iter()
            .map(|d| (tokenizer::coverage(&query_terms, &d.terms), d))
            .filter(|(score, _)| *score > 0.0 && *score >= score_threshold)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, d)| SearchHit {
                id: d.id.clone(),
                text: d.text.clone(),
                score,
                metadata: d.metadata.clone(),
            })
            .collect())
    }
}

/// 会话知识库集合名
pub fn conversation_collection(conversation_id: &str) -> String {
    format!("conversation_{conversation_id}")
}

/// 集合作用域
#[derive(Debug, Clone, PartialEq)]
enum CollectionScope {
    Fixed(String),
    PerConversation,
}

/// 绑定到一个集合作用域的知识源
#[derive(Clone)]
pub struct KnowledgeSource {
    kind: SourceKb,
    scope: CollectionScope,
    store: Arc<dyn VectorStore>,
}

impl KnowledgeSource {
    /// 全局知识库（共享集合）
    pub fn global(store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            kind: SourceKb::Global,
            scope: CollectionScope::Fixed(collection.into()),
            store,
        }
    }

    /// 会话知识库（集合随会话 ID 变化）
    pub fn conversation(store: Arc<dyn VectorStore>) -> Self {
        Self {
            kind: SourceKb::Conversation,
            scope: CollectionScope::PerConversation,
            store,
        }
    }

    pub fn kind(&self) -> SourceKb {
        self.kind
    }

    /// 本轮实际检索的集合；会话作用域但没有会话 ID 时为 None
    pub fn collection(&self, conversation_id: Option<&str>) -> Option<String> {
        match &self.scope {
            CollectionScope::Fixed(name) => Some(name.clone()),
            CollectionScope::PerConversation => conversation_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(conversation_collection),
        }
    }

    /// `search(query, topK, scoreThreshold)`：结果按分数降序，带来源与出处 ID
    pub async fn search(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<RetrievedChunk>, KnowledgeError> {
        let Some(collection) = self.collection(conversation_id) else {
            return Ok(Vec::new());
        };
        let hits = self
            .store
            .search(&collection, query, top_k, score_threshold)
            .await?;

        let mut chunks: Vec<RetrievedChunk> = hits
            .into_iter()
            .filter(|h| h.score >= score_threshold)
            .map(|h| RetrievedChunk {
                text: h.text,
                source_kb: self.kind,
                score: h.score,
                provenance_id: format!("{collection}:{}", h.id),
            })
            .collect();
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        chunks.truncate(top_k);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .add_document("global_knowledge", "g1", "Compound interest is interest on interest.")
            .await;
        store
            .add_document("global_knowledge", "g2", "A budget is a spending plan.")
            .await;
        store
            .add_document("conversation_c1", "d1", "My loan statement mentions compound interest.")
            .await;
        store
    }

    #[tokio::test]
    async fn test_missing_collection_returns_empty() {
        let store = store().await;
        let hits = store.search("nope", "compound interest", 5, 0.0).await.unwrap();
        assert!(hits.is_empty());

        let source = KnowledgeSource::conversation(store);
        let chunks = source
            .search("compound interest", Some("never-uploaded"), 5, 0.0)
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_scope_needs_an_id() {
        let source = KnowledgeSource::conversation(store().await);
        assert_eq!(source.collection(None), None);
        assert_eq!(source.collection(Some("c1")).as_deref(), Some("conversation_c1"));
        assert!(source.search("compound interest", None, 5, 0.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_sorted_and_thresholded() {
        let source = KnowledgeSource::global(store().await, "global_knowledge");
        let chunks = source
            .search("compound interest budget", None, 5, 0.3)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].score >= chunks[1].score);
        assert_eq!(chunks[0].provenance_id, "global_knowledge:g1");
        assert!(chunks.iter().all(|c| c.source_kb == SourceKb::Global));

        let strict = source.search("compound interest budget", None, 5, 0.9).await.unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_documents_do_not_leak() {
        let source = KnowledgeSource::conversation(store().await);
        let own = source.search("loan statement", Some("c1"), 5, 0.0).await.unwrap();
        let other = source.search("loan statement", Some("c2"), 5, 0.0).await.unwrap();
        assert_eq!(own.len(), 1);
        assert!(other.is_empty());
    }
}
