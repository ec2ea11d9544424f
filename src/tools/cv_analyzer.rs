//! 简历分析工具
//!
//! 对传入的简历文本做轻量结构分析：识别章节、匹配技能词典、估算从业年限。
//! 文件抽取不在此处，调用方需传入纯文本。

use std::collections::BTreeSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

pub const CV_TOOL_NAME: &str = "cv_analyzer";

const SECTION_HEADINGS: &[(&str, &[&str])] = &[
    ("experience", &["experience", "employment", "work history", "experiencia"]),
    ("education", &["education", "academic", "educación", "formación"]),
    ("skills", &["skills", "competencies", "habilidades"]),
    ("languages", &["languages", "idiomas"]),
    ("certifications", &["certifications", "certificates", "certificaciones"]),
    ("summary", &["summary", "profile", "objective", "perfil"]),
];

const SKILLS: &[&str] = &[
    "rust", "python", "java", "javascript", "typescript", "sql", "go", "c++", "kubernetes",
    "docker", "aws", "azure", "gcp", "excel", "machine learning", "data analysis",
    "project management", "leadership", "communication", "negotiation", "accounting", "sales",
];

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19[5-9]\d|20\d{2})\b").expect("static regex"))
}

pub struct CvAnalyzerTool;

impl CvAnalyzerTool {
    fn analyze(text: &str) -> Value {
        let lower = text.to_lowercase();

        let sections: Vec<&str> = SECTION_HEADINGS
            .iter()
            .filter(|(_, keys)| keys.iter().any(|k| lower.contains(k)))
            .map(|(name, _)| *name)
            .collect();

        // 归一为空格分隔的词序列，按整词匹配（"go" 不命中 "good"）
        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '+'))
            .filter(|w| !w.is_empty())
            .collect();
        let padded = format!(" {} ", words.join(" "));
        let skills: BTreeSet<&str> = SKILLS
            .iter()
            .copied()
            .filter(|s| padded.contains(&format!(" {s} ")))
            .collect();

        let years: Vec<u32> = year_regex()
            .find_iter(text)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        let span = match (years.iter().min(), years.iter().max()) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        };

        let missing: Vec<&str> = ["experience", "education", "skills"]
            .into_iter()
            .filter(|s| !sections.contains(s))
            .collect();

        serde_json::json!({
            "word_count": text.split_whitespace().count(),
            "sections_found": sections,
            "missing_sections": missing,
            "skills": skills,
            "estimated_years_span": span,
        })
    }
}

#[async_trait]
impl Tool for CvAnalyzerTool {
    fn name(&self) -> &str {
        CV_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Analyze CV/resume text: detected sections, missing sections, skills and career span."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "cv_text": { "type": "string", "description": "Plain-text CV content" },
                "input": { "type": "string" }
            },
            "required": []
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let text = args
            .get("cv_text")
            .or_else(|| args.get("input"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if text.is_empty() {
            return Err(ToolError::InvalidArguments("no CV text provided".to_string()));
        }
        Ok(Self::analyze(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_analyze_detects_sections_and_skills() {
        let cv = "Summary\nBackend engineer.\nExperience\nAcme 2015-2023: Rust, Python, Docker.\nEducation\nBSc 2011";
        let out = CvAnalyzerTool.invoke(json!({"cv_text": cv})).await.unwrap();
        let sections: Vec<&str> = out["sections_found"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(sections.contains(&"experience"));
        assert!(sections.contains(&"education"));
        assert_eq!(out["missing_sections"], json!(["skills"]));
        let skills = out["skills"].as_array().unwrap();
        assert!(skills.contains(&json!("rust")));
        assert!(skills.contains(&json!("docker")));
        assert_eq!(out["estimated_years_span"], 12);
    }

    #[tokio::test]
    async fn test_empty_cv_is_invalid() {
        let err = CvAnalyzerTool.invoke(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
