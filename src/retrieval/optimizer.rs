//! 查询优化器
//!
//! 把原始用户消息扩展为 1..=max_queries 条检索查询，步骤依次为：
//! 规范化 → 意图分类 → 领域词抽取与同义词扩展 → 按意图模板生成变体 → 去重 → 过滤 → 截断。
//! 任何一步失败都退回到"规范化后的原消息"这一条查询；消息非空时检索永远不会拿到零条查询。

use thiserror::Error;

use crate::memory::tokenizer;
use crate::memory::{Message, Role};

const MIN_QUERY_CHARS: usize = 3;
const MAX_QUERY_TOKENS: usize = 20;

/// 规范化时剥离的口头语（长的在前）
const FILLER_PHRASES: &[&str] = &[
    "i would like to know",
    "help me understand",
    "i want to know",
    "can you please",
    "could you please",
    "i was wondering",
    "can you",
    "could you",
    "tell me",
    "please",
    "quisiera saber",
    "quiero saber",
    "por favor",
    "puedes",
];

/// 查询意图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Definition,
    Explanation,
    Comparison,
    Guidance,
    Advice,
    Information,
}

/// 意图模式组（声明顺序即平分时的优先顺序）
const INTENT_PATTERNS: &[(QueryIntent, &[&str])] = &[
    (
        QueryIntent::Definition,
        &["what is", "what are", "define", "definition", "meaning of", "qué es", "significa"],
    ),
    (
        QueryIntent::Explanation,
        &["explain", "how does", "how do", "why", "works", "explica", "por qué"],
    ),
    (
        QueryIntent::Comparison,
        &["difference", "compare", "versus", "vs", "better than", "diferencia", "comparar"],
    ),
    (
        QueryIntent::Guidance,
        &["how to", "how can i", "steps", "guide", "cómo puedo", "pasos"],
    ),
    (
        QueryIntent::Advice,
        &["should i", "recommend", "advice", "best way", "debería", "consejo"],
    ),
];

/// 领域词典：词 -> 同义词
const DOMAIN_TERMS: &[(&str, &[&str])] = &[
    ("compound interest", &["interest compounding", "compound interest formula"]),
    ("simple interest", &["flat interest"]),
    ("interest rate", &["annual percentage rate"]),
    ("emergency fund", &["rainy day fund"]),
    ("credit score", &["credit rating"]),
    ("interest", &["interest rate"]),
    ("budget", &["budgeting", "spending plan"]),
    ("savings", &["saving money"]),
    ("loan", &["borrowing"]),
    ("mortgage", &["home loan"]),
    ("investment", &["investing"]),
    ("inflation", &["purchasing power"]),
    ("debt", &["liabilities"]),
    ("retirement", &["pension"]),
    ("tax", &["taxes"]),
    ("cv", &["resume", "curriculum vitae"]),
    ("resume", &["cv"]),
    ("survey", &["questionnaire"]),
    ("interés compuesto", &["interés sobre interés"]),
    ("ahorro", &["ahorrar dinero"]),
    ("préstamo", &["crédito"]),
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizeError {
    #[error("message is empty after normalization")]
    EmptyAfterNormalization,

    #[error("no usable query survived filtering")]
    NoUsableQueries,
}

/// 查询优化器
#[derive(Debug, Clone)]
pub struct QueryOptimizer {
    max_queries: usize,
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl QueryOptimizer {
    pub fn new(max_queries: usize) -> Self {
        Self {
            max_queries: max_queries.max(1),
        }
    }

    /// `optimize(message, recentContext?) -> list[string]`，长度不超过 max_queries
    pub fn optimize(&self, message: &str, recent_context: &[Message]) -> Vec<String> {
        self.optimize_with_limit(message, recent_context, self.max_queries)
    }

    /// 同 optimize，但本轮使用给定上限（单轮配置覆盖）
    pub fn optimize_with_limit(
        &self,
        message: &str,
        recent_context: &[Message],
        max_queries: usize,
    ) -> Vec<String> {
        if message.trim().is_empty() {
            return Vec::new();
        }
        match self.try_optimize(message, recent_context, max_queries.max(1)) {
            Ok(queries) => queries,
            Err(e) => {
                let normalized = normalize(message);
                let fallback = if normalized.is_empty() {
                    message.trim().to_lowercase()
                } else {
                    normalized
                };
                tracing::debug!(error = %e, query = %fallback, "query optimization fell back to the normalized message");
                vec![fallback]
            }
        }
    }

    fn try_optimize(
        &self,
        message: &str,
        recent_context: &[Message],
        max_queries: usize,
    ) -> Result<Vec<String>, OptimizeError> {
        let normalized = normalize(message);
        if normalized.is_empty() {
            return Err(OptimizeError::EmptyAfterNormalization);
        }

        let intent = classify_intent(&message.to_lowercase());
        let mut terms = extract_domain_terms(&normalized);
        if terms.is_empty() {
            terms = key_terms(&normalized);
        }

        let mut candidates = vec![normalized.clone()];
        if let Some(primary) = terms.first() {
            candidates.extend(intent_variants(intent, primary, terms.get(1)));
        }
        for term in &terms {
            candidates.push(term.clone());
            candidates.extend(synonyms_of(term).iter().map(|s| s.to_string()));
        }
        // 追问（"what about it?"）借用上一条用户消息的领域词
        if let Some(topic) = contextual_topic(&normalized, recent_context) {
            candidates.insert(1, format!("{topic} {normalized}"));
        }

        let queries = finalize(candidates, max_queries);
        if queries.is_empty() {
            return Err(OptimizeError::NoUsableQueries);
        }
        tracing::debug!(?intent, ?queries, "optimized queries");
        Ok(queries)
    }
}

/// 规范化：小写、剥离口头语、只保留字母数字（含带重音字母）与空白、合并空白
pub fn normalize(message: &str) -> String {
    let lower = message.to_lowercase();
    let cleaned: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    let mut padded = format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "));
    for filler in FILLER_PHRASES {
        let needle = format!(" {filler} ");
        while padded.contains(&needle) {
            padded = padded.replace(&needle, " ");
        }
    }
    padded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 关键词模式打分；最高分胜出，平分取先声明的组，全部为零时为 Information
pub fn classify_intent(text: &str) -> QueryIntent {
    let mut best = (QueryIntent::Information, 0usize);
    for (intent, patterns) in INTENT_PATTERNS {
        let score = patterns
            .iter()
            .filter(|p| tokenizer::contains_keyword(text, p))
            .count();
        if score > best.1 {
            best = (*intent, score);
        }
    }
    best.0
}

/// 词典中出现的领域词；已被更长词覆盖的短词跳过（"compound interest" 之后不再单列 "interest"）
fn extract_domain_terms(normalized: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut by_len: Vec<&str> = DOMAIN_TERMS.iter().map(|(t, _)| *t).collect();
    by_len.sort_by_key(|t| std::cmp::Reverse(t.len()));
    for term in by_len {
        if tokenizer::contains_keyword(normalized, term) && !found.iter().any(|f| f.contains(term)) {
            found.push(term.to_string());
        }
    }
    // 按在消息中出现的位置排序
    found.sort_by_key(|t| normalized.find(t.as_str()).unwrap_or(usize::MAX));
    found
}

/// 非停用词（保持顺序、去重），词典无命中时使用
fn key_terms(normalized: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in tokenizer::tokenize(normalized) {
        if !tokenizer::is_stop_word(&token) && token.chars().count() >= MIN_QUERY_CHARS && !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}

fn synonyms_of(term: &str) -> &'static [&'static str] {
    DOMAIN_TERMS
        .iter()
        .find(|(t, _)| *t == term)
        .map(|(_, syns)| *syns)
        .unwrap_or(&[])
}

fn intent_variants(intent: QueryIntent, term: &str, second: Option<&String>) -> Vec<String> {
    match intent {
        QueryIntent::Definition => vec![format!("{term} definition"), format!("what is {term}")],
        QueryIntent::Explanation => vec![format!("how {term} works"), format!("{term} explained")],
        QueryIntent::Comparison => match second {
            Some(other) => vec![format!("{term} vs {other}"), format!("difference between {term} and {other}")],
            None => vec![format!("{term} comparison")],
        },
        QueryIntent::Guidance => vec![format!("how to {term}"), format!("{term} steps")],
        QueryIntent::Advice => vec![format!("{term} advice"), format!("{term} recommendations")],
        QueryIntent::Information => vec![format!("{term} information")],
    }
}

/// 当前消息没有领域词、且包含指代词时，从最近一条用户消息里取领域词
fn contextual_topic(normalized: &str, recent_context: &[Message]) -> Option<String> {
    if !extract_domain_terms(normalized).is_empty() {
        return None;
    }
    let refers_back = ["it", "that", "this", "those", "eso", "esto"]
        .iter()
        .any(|p| tokenizer::contains_keyword(normalized, p));
    if !refers_back {
        return None;
    }
    recent_context
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .find_map(|m| extract_domain_terms(&normalize(&m.content)).into_iter().next())
}

/// 去重（大小写不敏感）→ 过滤（过短 / 全停用词 / 过长）→ 截断
fn finalize(candidates: Vec<String>, max_queries: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .map(|q| q.trim().to_string())
        .filter(|q| seen.insert(q.to_lowercase()))
        .filter(|q| q.chars().count() >= MIN_QUERY_CHARS)
        .filter(|q| !tokenizer::is_all_stop_words(q))
        .filter(|q| tokenizer::token_count(q) <= MAX_QUERY_TOKENS)
        .take(max_queries)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_fillers_and_punctuation() {
        assert_eq!(
            normalize("Can you please tell me: What is COMPOUND interest?!"),
            "what is compound interest"
        );
        assert_eq!(normalize("¿Qué es el interés compuesto?"), "qué es el interés compuesto");
    }

    #[test]
    fn test_intent_ties_break_by_declaration_order() {
        assert_eq!(classify_intent("what is the difference"), QueryIntent::Definition);
        assert_eq!(classify_intent("compare a versus b"), QueryIntent::Comparison);
        assert_eq!(classify_intent("loans"), QueryIntent::Information);
    }

    #[test]
    fn test_definition_query_expansion() {
        let queries = QueryOptimizer::default().optimize("What is compound interest?", &[]);
        assert_eq!(
            queries,
            vec![
                "what is compound interest".to_string(),
                "compound interest definition".to_string(),
                "compound interest".to_string(),
            ]
        );
    }

    #[test]
    fn test_respects_max_queries() {
        let queries = QueryOptimizer::new(5).optimize("Should I pay off debt or build savings?", &[]);
        assert!(queries.len() <= 5);
        assert!(queries.iter().any(|q| q == "debt advice"));
        assert_eq!(QueryOptimizer::new(1).optimize("budget tips", &[]).len(), 1);
    }

    #[test]
    fn test_stop_word_only_message_falls_back_to_normalized() {
        let queries = QueryOptimizer::default().optimize("What is the?", &[]);
        assert_eq!(queries, vec!["what is the".to_string()]);
    }

    #[test]
    fn test_empty_message_yields_no_queries() {
        assert!(QueryOptimizer::default().optimize("   ", &[]).is_empty());
    }

    #[test]
    fn test_punctuation_only_message_still_yields_a_query() {
        let queries = QueryOptimizer::default().optimize("???", &[]);
        assert_eq!(queries, vec!["???".to_string()]);
    }

    #[test]
    fn test_follow_up_borrows_topic() {
        let history = vec![Message::user("Tell me about mortgage options"), Message::assistant("...")];
        let queries = QueryOptimizer::new(3).optimize("how does it work", &history);
        assert_eq!(queries[1], "mortgage how does it work");
    }

    #[test]
    fn test_long_queries_are_filtered() {
        let long = "word ".repeat(30);
        let queries = finalize(vec![long, "ok".into(), "budget".into(), "BUDGET".into()], 3);
        assert_eq!(queries, vec!["budget".to_string()]);
    }
}
