//! 问卷生成工具
//!
//! 从主题（或原始用户消息）生成结构化问卷：Likert 量表、单选、开放题混合。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::tools::{Tool, ToolError};

pub const SURVEY_TOOL_NAME: &str = "survey_generator";

const DEFAULT_QUESTIONS: usize = 5;
const MAX_QUESTIONS: usize = 15;

/// 从原始消息中剥离的引导短语（按长度从长到短匹配）
const LEAD_INS: &[&str] = &[
    "create a survey about",
    "create a survey on",
    "create a survey for",
    "generate a survey about",
    "generate a survey on",
    "make a survey about",
    "build a questionnaire about",
    "crea una encuesta sobre",
    "create a survey",
    "generate a survey",
    "make a survey",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum QuestionKind {
    Likert,
    SingleChoice,
    OpenText,
}

#[derive(Debug, Serialize)]
struct Question {
    id: usize,
    text: String,
    kind: QuestionKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    options: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Survey {
    title: String,
    topic: String,
    questions: Vec<Question>,
}

pub struct SurveyGeneratorTool;

impl SurveyGeneratorTool {
    fn topic_from_input(input: &str) -> String {
        let lower = input.trim().to_lowercase();
        let rest = LEAD_INS
            .iter()
            .find_map(|p| lower.find(p).map(|idx| &lower[idx + p.len()..]))
            .unwrap_or(&lower);
        let topic = rest
            .trim()
            .trim_end_matches(|c: char| !c.is_alphanumeric())
            .trim();
        if topic.is_empty() {
            "general satisfaction".to_string()
        } else {
            topic.to_string()
        }
    }

    fn build(topic: &str, count: usize) -> Survey {
        let likert = vec![
            "Strongly disagree".to_string(),
            "Disagree".to_string(),
            "Neutral".to_string(),
            "Agree".to_string(),
            "Strongly agree".to_string(),
        ];
        let templates: [(&str, QuestionKind); 5] = [
            ("Overall, I am satisfied with {topic}.", QuestionKind::Likert),
            ("How often do you engage with {topic}?", QuestionKind::SingleChoice),
            ("{topic} meets my expectations.", QuestionKind::Likert),
            ("What do you value most about {topic}?", QuestionKind::OpenText),
            ("What one change would most improve {topic}?", QuestionKind::OpenText),
        ];
        let frequency = vec![
            "Daily".to_string(),
            "Weekly".to_string(),
            "Monthly".to_string(),
            "Rarely".to_string(),
            "Never".to_string(),
        ];

        let questions = (0..count)
            .map(|i| {
                let (template, kind) = &templates[i % templates.len()];
                let mut text = template.replace("{topic}", topic);
                if i >= templates.len() {
                    text = format!("(follow-up {}) {}", i / templates.len(), text);
                }
                let (kind, options) = match kind {
                    QuestionKind::Likert => (QuestionKind::Likert, likert.clone()),
                    QuestionKind::SingleChoice => (QuestionKind::SingleChoice, frequency.clone()),
                    QuestionKind::OpenText => (QuestionKind::OpenText, Vec::new()),
                };
                Question {
                    id: i + 1,
                    text,
                    kind,
                    options,
                }
            })
            .collect();

        Survey {
            title: format!("Survey: {topic}"),
            topic: topic.to_string(),
            questions,
        }
    }
}

#[async_trait]
impl Tool for SurveyGeneratorTool {
    fn name(&self) -> &str {
        SURVEY_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Generate a structured survey (Likert, single-choice and open questions) for a topic."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "topic": { "type": "string", "description": "Survey topic" },
                "num_questions": { "type": "integer", "minimum": 1, "maximum": MAX_QUESTIONS },
                "input": { "type": "string", "description": "Raw user request, used when topic is absent" }
            },
            "required": []
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let topic = match args.get("topic").and_then(Value::as_str) {
            Some(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => {
                let input = args.get("input").and_then(Value::as_str).unwrap_or("");
                Self::topic_from_input(input)
            }
        };
        let count = args
            .get("num_questions")
            .and_then(Value::as_u64)
            .map(|n| (n as usize).clamp(1, MAX_QUESTIONS))
            .unwrap_or(DEFAULT_QUESTIONS);

        serde_json::to_value(Self::build(&topic, count)).map_err(|e| ToolError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topic_from_input() {
        assert_eq!(
            SurveyGeneratorTool::topic_from_input("Please create a survey about remote work!"),
            "remote work"
        );
        assert_eq!(
            SurveyGeneratorTool::topic_from_input("create a survey"),
            "general satisfaction"
        );
    }

    #[tokio::test]
    async fn test_invoke_builds_requested_question_count() {
        let out = SurveyGeneratorTool
            .invoke(json!({"topic": "coffee", "num_questions": 7}))
            .await
            .unwrap();
        let questions = out["questions"].as_array().unwrap();
        assert_eq!(questions.len(), 7);
        assert_eq!(out["title"], "Survey: coffee");
        assert_eq!(questions[0]["kind"], "likert");
        assert_eq!(questions[3]["kind"], "open_text");
        assert!(questions[3].get("options").is_none());
    }
}
