//! 金融计算工具：复利 / 单利
//!
//! 参数可显式给出（principal / rate_percent / years / compounds_per_year / mode），
//! 也可从原始消息中解析，如 "1000 at 5% for 10 years"。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

pub const FINANCE_TOOL_NAME: &str = "financial_calculator";

fn rate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("static regex"))
}

fn years_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)\s*(?:years?|yrs?|años?)").expect("static regex")
    })
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[$€£]?\s*(\d[\d,]*(?:\.\d+)?)").expect("static regex"))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Inputs {
    principal: f64,
    rate_percent: f64,
    years: f64,
    compounds_per_year: u32,
    compound: bool,
}

pub struct FinancialCalculatorTool;

impl FinancialCalculatorTool {
    fn parse_free_text(text: &str) -> Option<(f64, f64, f64)> {
        let lower = text.to_lowercase();
        let rate_m = rate_re().captures(&lower)?;
        let years_m = years_re().captures(&lower)?;
        let rate: f64 = rate_m.get(1)?.as_str().parse().ok()?;
        let years: f64 = years_m.get(1)?.as_str().parse().ok()?;

        let taken = [rate_m.get(0)?.range(), years_m.get(0)?.range()];
        let principal = amount_re()
            .captures_iter(&lower)
            .filter(|c| {
                c.get(1)
                    .is_some_and(|m| !taken.iter().any(|r| r.contains(&m.start())))
            })
            .filter_map(|c| c.get(1)?.as_str().replace(',', "").parse::<f64>().ok())
            .next()?;
        Some((principal, rate, years))
    }

    fn inputs(args: &Value) -> Result<Inputs, ToolError> {
        let num = |k: &str| args.get(k).and_then(Value::as_f64);
        let (principal, rate_percent, years) =
            match (num("principal"), num("rate_percent"), num("years")) {
                (Some(p), Some(r), Some(y)) => (p, r, y),
                _ => args
                    .get("input")
                    .and_then(Value::as_str)
                    .and_then(Self::parse_free_text)
                    .ok_or_else(|| {
                        ToolError::InvalidArguments(
                            "need principal, rate_percent and years".to_string(),
                        )
                    })?,
            };
        if principal < 0.0 || rate_percent < 0.0 || years < 0.0 {
            return Err(ToolError::InvalidArguments("values must be non-negative".to_string()));
        }
        let compounds_per_year = args
            .get("compounds_per_year")
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX).max(1))
            .unwrap_or(12);
        let compound = args.get("mode").and_then(Value::as_str) != Some("simple");
        Ok(Inputs {
            principal,
            rate_percent,
            years,
            compounds_per_year,
            compound,
        })
    }

    fn compute(i: Inputs) -> f64 {
        let r = i.rate_percent / 100.0;
        if i.compound {
            let n = f64::from(i.compounds_per_year);
            i.principal * (1.0 + r / n).powf(n * i.years)
        } else {
            i.principal * (1.0 + r * i.years)
        }
    }
}

#[async_trait]
impl Tool for FinancialCalculatorTool {
    fn name(&self) -> &str {
        FINANCE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Compute compound or simple interest. Args: principal, rate_percent, years, compounds_per_year, mode (compound|simple)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "principal": { "type": "number" },
                "rate_percent": { "type": "number" },
                "years": { "type": "number" },
                "compounds_per_year": { "type": "integer", "minimum": 1 },
                "mode": { "type": "string", "enum": ["compound", "simple"] },
                "input": { "type": "string" }
            },
            "required": []
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let inputs = Self::inputs(&args)?;
        let future_value = Self::compute(inputs);
        let round = |x: f64| (x * 100.0).round() / 100.0;
        Ok(serde_json::json!({
            "mode": if inputs.compound { "compound" } else { "simple" },
            "principal": inputs.principal,
            "rate_percent": inputs.rate_percent,
            "years": inputs.years,
            "compounds_per_year": inputs.compounds_per_year,
            "future_value": round(future_value),
            "interest_earned": round(future_value - inputs.principal),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_compound_annual() {
        let out = FinancialCalculatorTool
            .invoke(json!({"principal": 1000.0, "rate_percent": 10.0, "years": 2.0, "compounds_per_year": 1}))
            .await
            .unwrap();
        assert_eq!(out["future_value"], 1210.0);
        assert_eq!(out["interest_earned"], 210.0);
    }

    #[tokio::test]
    async fn test_simple_mode() {
        let out = FinancialCalculatorTool
            .invoke(json!({"principal": 1000.0, "rate_percent": 5.0, "years": 3.0, "mode": "simple"}))
            .await
            .unwrap();
        assert_eq!(out["future_value"], 1150.0);
    }

    #[test]
    fn test_parse_free_text() {
        let parsed = FinancialCalculatorTool::parse_free_text("If I invest $1,000 at 5% for 10 years?");
        assert_eq!(parsed, Some((1000.0, 5.0, 10.0)));
    }

    #[tokio::test]
    async fn test_missing_values_are_invalid() {
        let err = FinancialCalculatorTool
            .invoke(json!({"input": "what is compound interest?"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_oversized_compounding_is_clamped() {
        let out = FinancialCalculatorTool
            .invoke(json!({"principal": 1000.0, "rate_percent": 5.0, "years": 1.0, "compounds_per_year": 4294967296u64}))
            .await
            .unwrap();
        assert_eq!(out["compounds_per_year"], u32::MAX);
        let fv = out["future_value"].as_f64().unwrap();
        assert!(fv.is_finite());
        assert!((fv - 1051.27).abs() < 0.05);
    }
}
