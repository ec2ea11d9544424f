//! 分词与停用词
//!
//! 检索打分（关键词重叠）与查询过滤（停用词、长度）共用的分词能力。
//! 含 CJK 字符时使用 jieba-rs，否则按空白与标点切分。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 英文与西班牙文常见停用词
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "of", "to", "in", "on", "for",
    "and", "or", "but", "with", "at", "by", "from", "it", "this", "that", "these", "those", "i",
    "you", "me", "my", "we", "our", "your", "do", "does", "did", "can", "could", "would",
    "should", "what", "how", "why", "which", "who", "about", "please", "tell", "some", "any",
    "el", "la", "los", "las", "un", "una", "de", "del", "y", "o", "que", "en", "por", "para",
    "con", "es", "son", "se", "lo", "al", "mi", "tu", "su", "como", "qué", "cómo",
];

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{309F}' |
        '\u{30A0}'..='\u{30FF}'
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

/// 分词（全部小写）。CJK 文本走 jieba 搜索引擎模式，其余按非字母数字字符切分。
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty() && s.chars().any(char::is_alphanumeric))
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .collect()
    }
}

/// 去掉停用词后的词集合（用于相似度计算）
pub fn content_terms(text: &str) -> HashSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stop_word(t))
        .collect()
}

/// 词数（用于查询长度上限）
pub fn token_count(text: &str) -> usize {
    tokenize(text).len()
}

/// 是否全部由停用词组成（空文本视为是）
pub fn is_all_stop_words(text: &str) -> bool {
    tokenize(text).iter().all(|t| is_stop_word(t))
}

/// 关键词命中：多词短语按子串匹配，单词按整词匹配（"cv" 不命中 "cvs"），均忽略大小写
pub fn contains_keyword(text: &str, keyword: &str) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    let lower = text.to_lowercase();
    if keyword.contains(char::is_whitespace) || contains_cjk(&keyword) {
        lower.contains(&keyword)
    } else {
        lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|w| w == keyword)
    }
}

/// 查询词在文档词集中的覆盖率：|q ∩ d| / |q|
pub fn coverage(query: &HashSet<String>, doc: &HashSet<String>) -> f32 {
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    query.intersection(doc).count() as f32 / query.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_english_strips_punctuation() {
        let tokens = tokenize("What is compound interest?");
        assert_eq!(tokens, vec!["what", "is", "compound", "interest"]);
    }

    #[test]
    fn test_tokenize_keeps_accented_letters() {
        let tokens = tokenize("¿Qué es el interés compuesto?");
        assert!(tokens.contains(&"interés".to_string()));
        assert!(tokens.contains(&"qué".to_string()));
    }

    #[test]
    fn test_tokenize_chinese() {
        let tokens = tokenize("复利是什么");
        assert!(!tokens.is_empty());
    }

    #[test]
    fn test_all_stop_words() {
        assert!(is_all_stop_words("what is the"));
        assert!(!is_all_stop_words("what is interest"));
    }

    #[test]
    fn test_contains_keyword() {
        assert!(contains_keyword("Please review my CV.", "cv"));
        assert!(!contains_keyword("I like CVS pharmacy", "cv"));
        assert!(contains_keyword("Can you Create A Survey?", "create a survey"));
    }

    #[test]
    fn test_coverage() {
        let q = content_terms("compound interest");
        let d = content_terms("Compound interest grows on accumulated interest");
        assert!((coverage(&q, &d) - 1.0).abs() < f32::EPSILON);
    }
}
