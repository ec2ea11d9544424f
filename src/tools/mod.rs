pub mod cv_analyzer;
pub mod decision;
pub mod echo;
pub mod emergency_resources;
pub mod executor;
pub mod financial_calculator;
pub mod protocol;
pub mod registry;
pub mod survey_generator;

pub use cv_analyzer::{CvAnalyzerTool, CV_TOOL_NAME};
pub use decision::{DecisionOutcome, KeywordTrigger, ToolDecisionEngine, TOOL_DECISION_PROMPT};
pub use echo::EchoTool;
pub use emergency_resources::{EmergencyResourcesTool, EMERGENCY_TOOL_NAME};
pub use executor::{ToolExecutor, ToolRun};
pub use financial_calculator::{FinancialCalculatorTool, FINANCE_TOOL_NAME};
pub use protocol::{parse_agent_output, tool_call_schema_json, AgentOutput, ToolCall};
pub use registry::{Tool, ToolError, ToolRegistry};
pub use survey_generator::{SurveyGeneratorTool, SURVEY_TOOL_NAME};

/// 内置工具注册表：问卷、简历、金融计算、紧急资源与 echo
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(SurveyGeneratorTool);
    registry.register(CvAnalyzerTool);
    registry.register(FinancialCalculatorTool);
    registry.register(EmergencyResourcesTool);
    registry.register(EchoTool);
    registry
}
