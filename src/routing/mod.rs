//! 路由：RAG / Agent 路由决策与业务流程分类

pub mod business;
pub mod decider;

pub use business::{
    BusinessProcessClassifier, OverrideSet, Predicate, ProcessDefinition, Rule, RuleAction,
    RuleContext, RuleLoadError,
};
pub use decider::{RoutingDecider, RoutingOutcome, ROUTING_SYSTEM_PROMPT};
