//! 安全护栏
//!
//! Guardrail trait 是一次校验：`check(text, direction, context) -> ValidationResult`。
//! GuardrailGate 在其上实现输入 / 输出两个方向的处置策略：
//! - 输入：不安全且 high/critical 立即阻断；low/medium 记录后原样放行
//! - 输出：不安全且 high/critical 触发有界重生成（retry_count < max_retries），超限后附加免责声明；
//!   非阻断结果若带 modified_text（如 PII 脱敏）则使用修改后的文本
//! - 护栏自身出错永远不阻断本轮：按"安全"处理，错误只进入可观测数据

pub mod policy;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use policy::PolicyGuardrail;

use crate::core::ValidationResult;

/// 校验方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// 校验上下文
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardrailContext {
    pub session_id: String,
    pub user_id: Option<String>,
}

impl GuardrailContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardrailError {
    #[error("guardrail backend unavailable: {0}")]
    Unavailable(String),

    #[error("guardrail internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    async fn check(
        &self,
        text: &str,
        direction: Direction,
        ctx: &GuardrailContext,
    ) -> Result<ValidationResult, GuardrailError>;
}

/// 输入处置
#[derive(Debug, Clone, PartialEq)]
pub enum InputVerdict {
    Proceed,
    Block,
}

/// 输出处置
#[derive(Debug, Clone, PartialEq)]
pub enum OutputVerdict {
    /// 使用给定文本作为最终回复（可能已脱敏）
    Accept(String),
    /// 重新生成
    Regenerate,
    /// 重试已用尽：附加免责声明后的文本
    Disclaim(String),
}

/// 一次门控的结果
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome<V> {
    pub verdict: V,
    pub validation: ValidationResult,
    /// 护栏自身的错误（已按安全处理）
    pub error: Option<String>,
}

pub struct GuardrailGate {
    guardrail: Arc<dyn Guardrail>,
    enabled: bool,
}

impl GuardrailGate {
    pub fn new(guardrail: Arc<dyn Guardrail>) -> Self {
        Self {
            guardrail,
            enabled: true,
        }
    }

    pub fn disabled(guardrail: Arc<dyn Guardrail>) -> Self {
        Self {
            guardrail,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn run(
        &self,
        text: &str,
        direction: Direction,
        ctx: &GuardrailContext,
    ) -> (ValidationResult, Option<String>) {
        if !self.enabled {
            return (ValidationResult::pass(), None);
        }
        match self.guardrail.check(text, direction, ctx).await {
            Ok(result) => (result, None),
            Err(e) => {
                tracing::warn!(?direction, error = %e, "guardrail failed, treating text as safe");
                (ValidationResult::pass(), Some(e.to_string()))
            }
        }
    }

    pub async fn check_input(&self, text: &str, ctx: &GuardrailContext) -> GateOutcome<InputVerdict> {
        let (validation, error) = self.run(text, Direction::Input, ctx).await;
        let verdict = if validation.blocks() {
            tracing::warn!(severity = ?validation.severity, violations = ?validation.violations, "input blocked");
            InputVerdict::Block
        } else {
            if !validation.safe {
                tracing::info!(severity = ?validation.severity, violations = ?validation.violations, "input flagged, passing through");
            }
            InputVerdict::Proceed
        };
        GateOutcome {
            verdict,
            validation,
            error,
        }
    }

    pub async fn check_output(
        &self,
        text: &str,
        ctx: &GuardrailContext,
        retry_count: u32,
        max_retries: u32,
        disclaimer: &str,
    ) -> GateOutcome<OutputVerdict> {
        let (validation, error) = self.run(text, Direction::Output, ctx).await;
        let verdict = if validation.blocks() {
            if retry_count < max_retries {
                tracing::warn!(retry = retry_count + 1, max_retries, "output failed validation, regenerating");
                OutputVerdict::Regenerate
            } else {
                tracing::warn!(max_retries, "output retries exhausted, appending disclaimer");
                OutputVerdict::Disclaim(append_disclaimer(text, disclaimer))
            }
        } else {
            match &validation.modified_text {
                Some(modified) if !modified.trim().is_empty() => OutputVerdict::Accept(modified.clone()),
                _ => OutputVerdict::Accept(text.to_string()),
            }
        };
        GateOutcome {
            verdict,
            validation,
            error,
        }
    }
}

/// 在回复末尾附加免责声明（空回复时只返回声明本身）
pub fn append_disclaimer(text: &str, disclaimer: &str) -> String {
    let text = text.trim_end();
    if text.is_empty() {
        disclaimer.to_string()
    } else {
        format!("{text}\n\n{disclaimer}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Severity;

    struct Fixed(ValidationResult);

    #[async_trait]
    impl Guardrail for Fixed {
        async fn check(&self, _: &str, _: Direction, _: &GuardrailContext) -> Result<ValidationResult, GuardrailError> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl Guardrail for Broken {
        async fn check(&self, _: &str, _: Direction, _: &GuardrailContext) -> Result<ValidationResult, GuardrailError> {
            Err(GuardrailError::Unavailable("moderation API down".to_string()))
        }
    }

    fn unsafe_with(severity: Severity) -> ValidationResult {
        ValidationResult {
            safe: false,
            severity,
            violations: vec!["x".to_string()],
            modified_text: None,
        }
    }

    #[tokio::test]
    async fn test_input_block_only_for_high_and_critical() {
        let ctx = GuardrailContext::new("s");
        let gate = GuardrailGate::new(Arc::new(Fixed(unsafe_with(Severity::Critical))));
        assert_eq!(gate.check_input("x", &ctx).await.verdict, InputVerdict::Block);

        let gate = GuardrailGate::new(Arc::new(Fixed(unsafe_with(Severity::Medium))));
        assert_eq!(gate.check_input("x", &ctx).await.verdict, InputVerdict::Proceed);
    }

    #[tokio::test]
    async fn test_output_retry_then_disclaimer() {
        let ctx = GuardrailContext::new("s");
        let gate = GuardrailGate::new(Arc::new(Fixed(unsafe_with(Severity::High))));
        let first = gate.check_output("draft", &ctx, 0, 2, "Careful.").await;
        assert_eq!(first.verdict, OutputVerdict::Regenerate);
        let last = gate.check_output("draft", &ctx, 2, 2, "Careful.").await;
        assert_eq!(last.verdict, OutputVerdict::Disclaim("draft\n\nCareful.".to_string()));
    }

    #[tokio::test]
    async fn test_guardrail_errors_are_treated_as_safe() {
        let ctx = GuardrailContext::new("s");
        let gate = GuardrailGate::new(Arc::new(Broken));
        let input = gate.check_input("anything", &ctx).await;
        assert_eq!(input.verdict, InputVerdict::Proceed);
        assert!(input.error.unwrap().contains("moderation API down"));

        let output = gate.check_output("reply", &ctx, 0, 2, "d").await;
        assert_eq!(output.verdict, OutputVerdict::Accept("reply".to_string()));
    }

    #[tokio::test]
    async fn test_output_uses_modified_text() {
        let ctx = GuardrailContext::new("s");
        let result = ValidationResult {
            safe: false,
            severity: Severity::Low,
            violations: vec!["low:pii_email".to_string()],
            modified_text: Some("redacted".to_string()),
        };
        let gate = GuardrailGate::new(Arc::new(Fixed(result)));
        let out = gate.check_output("a@b.co", &ctx, 0, 2, "d").await;
        assert_eq!(out.verdict, OutputVerdict::Accept("redacted".to_string()));
    }

    #[tokio::test]
    async fn test_disabled_gate_passes_everything() {
        let ctx = GuardrailContext::new("s");
        let gate = GuardrailGate::disabled(Arc::new(Fixed(unsafe_with(Severity::Critical))));
        assert_eq!(gate.check_input("x", &ctx).await.verdict, InputVerdict::Proceed);
    }
}
