//! Tool-calling LLM provider client

pub mod chat;
pub mod client;

pub use chat::{ChatError, ChatMessage, ChatResponse, FunctionCall, Tool, ToolCall, Usage};
pub use client::{HttpLlmClient, LlmConfig, LlmProvider};
