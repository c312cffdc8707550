//! Host-side tools
//!
//! Tools that run on the host rather than over the guest RPC channel: web
//! search, webpage fetching, and credential typing. `typeSecret` resolves an
//! opaque token to the secret value and types it straight into the guest;
//! the secret itself never appears in a tool result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::guest::GuestTransport;

use super::registry::{str_arg, ToolEntry, ToolError, ToolRegistry};

/// Upper bound on webpage text returned to the model
const MAX_PAGE_CHARS: usize = 16_384;

/// Resolves opaque credential tokens to secret values.
///
/// The model only ever sees the token; resolution happens host-side.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<String>;
}

/// Register host-side tools.
///
/// # Arguments
/// * `http` - Shared HTTP client for the web tools
/// * `resolver` - Credential token resolver for `typeSecret`
/// * `transport` - Guest transport `typeSecret` types into
pub fn register_local_tools(
    registry: &mut ToolRegistry,
    http: reqwest::Client,
    resolver: Arc<dyn CredentialResolver>,
    transport: Arc<GuestTransport>,
) {
    let client = http.clone();
    registry.register(
        "webSearch",
        ToolEntry::new(
            "Search the web and return a short summary of results.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        )
        .with_skill("web"),
        Arc::new(move |args| {
            let client = client.clone();
            Box::pin(async move {
                let query = str_arg(&args, "query")?;
                let response = client
                    .get("https://api.duckduckgo.com/")
                    .query(&[("q", query.as_str()), ("format", "json"), ("no_html", "1")])
                    .send()
                    .await
                    .map_err(|e| ToolError::Failed(format!("search request failed: {}", e)))?;
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| ToolError::Failed(format!("bad search payload: {}", e)))?;
                let abstract_text = body["AbstractText"].as_str().unwrap_or("");
                let related: Vec<Value> = body["RelatedTopics"]
                    .as_array()
                    .map(|topics| {
                        topics
                            .iter()
                            .filter_map(|t| t["Text"].as_str())
                            .take(5)
                            .map(|t| json!(t))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({"summary": abstract_text, "results": related}))
            })
        }),
    );

    let client = http;
    registry.register(
        "fetchWebpage",
        ToolEntry::new(
            "Fetch a webpage and return its text content, truncated.",
            json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        )
        .with_skill("web"),
        Arc::new(move |args| {
            let client = client.clone();
            Box::pin(async move {
                let url = str_arg(&args, "url")?;
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| ToolError::Failed(format!("fetch failed: {}", e)))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(ToolError::Failed(format!("{} returned {}", url, status)));
                }
                let mut text = response
                    .text()
                    .await
                    .map_err(|e| ToolError::Failed(format!("fetch failed: {}", e)))?;
                let truncated = text.len() > MAX_PAGE_CHARS;
                if truncated {
                    let mut cut = MAX_PAGE_CHARS;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                }
                Ok(json!({"content": text, "truncated": truncated}))
            })
        }),
    );

    registry.register(
        "typeSecret",
        ToolEntry::new(
            "Type a stored credential into the focused field. Pass the credential token, not the secret.",
            json!({
                "type": "object",
                "properties": {"token": {"type": "string", "description": "Credential token (UUID)"}},
                "required": ["token"]
            }),
        ),
        Arc::new(move |args| {
            let resolver = Arc::clone(&resolver);
            let transport = Arc::clone(&transport);
            Box::pin(async move {
                let token = str_arg(&args, "token")?;
                let secret = resolver
                    .resolve(&token)
                    .await
                    .ok_or_else(|| ToolError::Failed(format!("unknown credential token {}", token)))?;
                transport.keyboard_type(&secret).await?;
                // Only an acknowledgement goes back to the model.
                Ok(json!({"typed": true}))
            })
        }),
    );
}
