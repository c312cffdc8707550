//! HTTP client for OpenAI-style chat-completions providers
//!
//! The control loop depends on the `LlmProvider` trait, not this client, so
//! tests can script completions without a network.

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Duration;

use super::chat::{ChatError, ChatMessage, ChatResponse, FunctionCall, Tool, ToolCall, Usage};

/// Completion provider seam used by the agent loop
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier, used for logging and metrics labels.
    fn model(&self) -> &str;

    /// One completion over the full conversation so far.
    async fn chat(&self, messages: &[ChatMessage], tools: &[Tool])
        -> Result<ChatResponse, ChatError>;
}

/// Configuration for the HTTP provider client
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL up to and excluding `/chat/completions`
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Hard bound on one completion request
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Client for an OpenAI-style `/chat/completions` endpoint
#[derive(Clone)]
pub struct HttpLlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl HttpLlmClient {
    /// Create a new provider client
    ///
    /// # Arguments
    /// * `config` - Provider endpoint, model and timeout settings
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

/// Convert a domain message to the provider wire shape. Tool-call arguments
/// travel as a JSON-encoded string on the wire.
fn wire_message(msg: &ChatMessage) -> Value {
    let mut value = serde_json::json!({
        "role": msg.role,
        "content": msg.content,
    });
    if let Some(calls) = &msg.tool_calls {
        let wire_calls: Vec<Value> = calls
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.id,
                    "type": "function",
                    "function": {
                        "name": c.function.name,
                        "arguments": c.function.arguments.to_string(),
                    }
                })
            })
            .collect();
        value["tool_calls"] = Value::Array(wire_calls);
    }
    if let Some(id) = &msg.tool_call_id {
        value["tool_call_id"] = Value::String(id.clone());
    }
    value
}

/// Parse a chat-completions response body into a `ChatResponse`.
fn parse_chat_response(body: &Value) -> Result<ChatResponse, ChatError> {
    let message = body["choices"]
        .get(0)
        .map(|c| &c["message"])
        .ok_or(ChatError::EmptyResponse)?;

    let content = message["content"].as_str().unwrap_or("").to_string();

    let tool_calls = message["tool_calls"].as_array().map(|calls| {
        calls
            .iter()
            .map(|c| {
                let raw = c["function"]["arguments"].as_str().unwrap_or("{}");
                // A model can emit unparseable argument JSON; keep the raw
                // text and let the dispatcher report it as a tool failure.
                let arguments = serde_json::from_str(raw)
                    .unwrap_or_else(|_| Value::String(raw.to_string()));
                ToolCall {
                    id: c["id"].as_str().unwrap_or("").to_string(),
                    function: FunctionCall {
                        name: c["function"]["name"].as_str().unwrap_or("").to_string(),
                        arguments,
                    },
                }
            })
            .collect::<Vec<_>>()
    });
    let tool_calls = tool_calls.filter(|c| !c.is_empty());

    let usage: Usage = body
        .get("usage")
        .cloned()
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    Ok(ChatResponse {
        message: ChatMessage {
            role: "assistant".to_string(),
            content,
            tool_calls,
            tool_call_id: None,
        },
        usage,
    })
}

#[async_trait]
impl LlmProvider for HttpLlmClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[Tool],
    ) -> Result<ChatResponse, ChatError> {
        let endpoint = format!("{}/chat/completions", self.config.base_url);

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "temperature": 0.0,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let mut request = self.client.post(&endpoint).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ChatError::Provider(format!("{}: {}", status, text)));
        }
        if text.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        let parsed: Value = serde_json::from_str(&text)?;
        parse_chat_response(&parsed)
    }
}
