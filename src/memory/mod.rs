//! 消息与文本工具：对话消息、历史承接、分词

pub mod conversation;
pub mod tokenizer;

pub use conversation::{ConversationMemory, Message, Role};
