//! MCP server tool registration
//!
//! External tool servers contribute tools under `mcp_{server}_{tool}` names
//! so they can never shadow built-ins. Dispatch forwards to the server with
//! the original tool name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::registry::{ToolEntry, ToolError, ToolRegistry};

/// One tool advertised by an MCP server
#[derive(Debug, Clone)]
pub struct McpToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub input_schema: Value,
}

/// Boundary to one external MCP tool server
#[async_trait]
pub trait McpServer: Send + Sync {
    /// Server name used in the `mcp_{server}_{tool}` prefix.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolSpec>, ToolError>;

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolError>;
}

/// Register every tool of one MCP server under its prefixed name.
pub async fn register_mcp_server(
    registry: &mut ToolRegistry,
    server: Arc<dyn McpServer>,
) -> Result<(), ToolError> {
    let tools = server.list_tools().await?;
    for spec in tools {
        let prefixed = format!("mcp_{}_{}", server.name(), spec.name);
        let server = Arc::clone(&server);
        let tool_name = spec.name.clone();
        registry.register(
            prefixed,
            ToolEntry::new(spec.description, spec.input_schema),
            Arc::new(move |args| {
                let server = Arc::clone(&server);
                let tool_name = tool_name.clone();
                Box::pin(async move { server.call_tool(&tool_name, args).await })
            }),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeServer;

    #[async_trait]
    impl McpServer for FakeServer {
        fn name(&self) -> &str {
            "notes"
        }

        async fn list_tools(&self) -> Result<Vec<McpToolSpec>, ToolError> {
            Ok(vec![McpToolSpec {
                name: "search".into(),
                description: "Search notes".into(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
            Ok(json!({"tool": tool, "args": arguments}))
        }
    }

    #[tokio::test]
    async fn tools_are_registered_with_server_prefix() {
        let mut registry = ToolRegistry::new();
        register_mcp_server(&mut registry, Arc::new(FakeServer))
            .await
            .unwrap();

        assert!(registry.contains("mcp_notes_search"));
        // Dispatch forwards the unprefixed name to the server.
        let out = registry
            .dispatch("mcp_notes_search", json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(out["tool"], "search");
        assert_eq!(out["args"]["q"], "rust");
    }
}
