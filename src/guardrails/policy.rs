//! 规则型护栏：按类别的屏蔽词 + PII 正则
//!
//! - critical / high / medium 屏蔽词：大小写不敏感的短语匹配，违规项形如 `high:jailbreak`
//! - PII（邮箱、电话、疑似卡号）：low 级别；输出方向额外给出脱敏后的 modified_text

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::config::GuardrailsSection;
use crate::core::{Severity, ValidationResult};
use crate::guardrails::{Direction, Guardrail, GuardrailContext, GuardrailError};
use crate::memory::tokenizer::contains_keyword;

struct PiiPattern {
    label: &'static str,
    regex: Regex,
    replacement: &'static str,
}

fn pii_patterns() -> &'static [PiiPattern] {
    static PATTERNS: OnceLock<Vec<PiiPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            PiiPattern {
                label: "email",
                regex: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("static regex"),
                replacement: "[redacted email]",
            },
            PiiPattern {
                label: "card_number",
                regex: Regex::new(r"\b\d(?:[ -]?\d){12,15}\b").expect("static regex"),
                replacement: "[redacted card]",
            },
            PiiPattern {
                label: "phone",
                regex: Regex::new(r"\+?\d{1,3}[ .-]?\(?\d{2,4}\)?[ .-]?\d{3,4}[ .-]?\d{3,4}\b")
                    .expect("static regex"),
                replacement: "[redacted phone]",
            },
        ]
    })
}

/// 规则型护栏
#[derive(Debug, Clone)]
pub struct PolicyGuardrail {
    critical: Vec<String>,
    high: Vec<String>,
    medium: Vec<String>,
    detect_pii: bool,
}

impl Default for PolicyGuardrail {
    fn default() -> Self {
        Self::from_config(&GuardrailsSection::default())
    }
}

impl PolicyGuardrail {
    pub fn from_config(cfg: &GuardrailsSection) -> Self {
        Self {
            critical: cfg.critical_terms.clone(),
            high: cfg.high_terms.clone(),
            medium: cfg.medium_terms.clone(),
            detect_pii: cfg.detect_pii,
        }
    }

    fn term_violations(&self, text: &str) -> Vec<(Severity, String)> {
        let tiers = [
            (Severity::Critical, &self.critical),
            (Severity::High, &self.high),
            (Severity::Medium, &self.medium),
        ];
        let mut found = Vec::new();
        for (severity, terms) in tiers {
            for term in terms.iter().filter(|t| contains_keyword(text, t)) {
                found.push((severity, format!("{}:{}", severity_label(severity), term)));
            }
        }
        found
    }

    /// 返回 (违规项, 脱敏文本)；无 PII 时脱敏文本为 None
    fn scan_pii(&self, text: &str) -> (Vec<String>, Option<String>) {
        if !self.detect_pii {
            return (Vec::new(), None);
        }
        let mut violations = Vec::new();
        let mut redacted = text.to_string();
        for pattern in pii_patterns() {
            if pattern.regex.is_match(&redacted) {
                violations.push(format!("low:pii_{}", pattern.label));
                redacted = pattern
                    .regex
                    .replace_all(&redacted, pattern.replacement)
                    .into_owned();
            }
        }
        let modified = (!violations.is_empty()).then_some(redacted);
        (violations, modified)
    }
}

fn severity_label(s: Severity) -> &'static str {
    match s {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

#[async_trait]
impl Guardrail for PolicyGuardrail {
    async fn check(
        &self,
        text: &str,
        direction: Direction,
        _ctx: &GuardrailContext,
    ) -> Result<ValidationResult, GuardrailError> {
        let terms = self.term_violations(text);
        let (pii, redacted) = self.scan_pii(text);

        let severity = terms
            .iter()
            .map(|(s, _)| *s)
            .max()
            .unwrap_or(Severity::Low);
        let mut violations: Vec<String> = terms.into_iter().map(|(_, v)| v).collect();
        violations.extend(pii);

        Ok(ValidationResult {
            safe: violations.is_empty(),
            severity,
            violations,
            modified_text: match direction {
                Direction::Output => redacted,
                Direction::Input => None,
            },
        })
    }
}
