//! Tool registry and dispatch
//!
//! Maps tool names to a JSON-Schema description plus a boxed async executor.
//! The LLM-facing schema excludes internal-only tools and filters by the
//! session's skill set. An unknown name is a tool-level failure the loop
//! feeds back to the model, never a loop failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::guest::TransportError;
use crate::llm::Tool;

/// Error type for tool dispatch
#[derive(Debug)]
pub enum ToolError {
    /// No tool registered under this name
    NotFound(String),
    /// Arguments did not match the tool's schema
    InvalidArguments(String),
    /// Guest transport failure; fatal variants end the session
    Transport(TransportError),
    /// The tool ran and failed
    Failed(String),
    /// The user denied a permission-gated call
    PermissionDenied(String),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
            ToolError::Transport(e) => write!(f, "transport error: {}", e),
            ToolError::Failed(msg) => write!(f, "tool failed: {}", msg),
            ToolError::PermissionDenied(name) => {
                write!(f, "permission denied for {}", name)
            }
        }
    }
}

impl std::error::Error for ToolError {}

impl From<TransportError> for ToolError {
    fn from(e: TransportError) -> Self {
        ToolError::Transport(e)
    }
}

impl ToolError {
    /// True when the session cannot continue (connection to the VM is gone).
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Transport(e) if e.is_fatal())
    }
}

/// Boxed future returned by tool executors
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// Async closure executing one tool call
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Registration metadata for one tool
#[derive(Clone)]
pub struct ToolEntry {
    pub description: String,
    /// JSON Schema of the arguments object
    pub parameters: Value,
    /// Internal tools are callable by the host but hidden from the LLM
    pub internal: bool,
    /// Dispatch parks on a user permission grant first
    pub requires_permission: bool,
    /// When set, the tool is only advertised to sessions with this skill
    pub skill: Option<String>,
}

impl ToolEntry {
    pub fn new(description: impl Into<String>, parameters: Value) -> Self {
        Self {
            description: description.into(),
            parameters,
            internal: false,
            requires_permission: false,
            skill: None,
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn gated(mut self) -> Self {
        self.requires_permission = true;
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }
}

/// Registry of tools available to one session's VM
#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, (ToolEntry, ToolExecutor)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, entry: ToolEntry, executor: ToolExecutor) {
        let name = name.into();
        if self.entries.insert(name.clone(), (entry, executor)).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the newer one");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn requires_permission(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|(entry, _)| entry.requires_permission)
            .unwrap_or(false)
    }

    /// Tool definitions to advertise to the LLM: internal tools excluded,
    /// skill-scoped tools filtered by the session's skills. Sorted by name
    /// so request payloads are deterministic.
    pub fn llm_tools(&self, skills: &[String]) -> Vec<Tool> {
        let mut names: Vec<&String> = self
            .entries
            .iter()
            .filter(|(_, (entry, _))| {
                if entry.internal {
                    return false;
                }
                match &entry.skill {
                    Some(skill) => skills.iter().any(|s| s == skill),
                    None => true,
                }
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let (entry, _) = &self.entries[name];
                Tool::function(name.clone(), entry.description.clone(), entry.parameters.clone())
            })
            .collect()
    }

    /// Execute one tool call.
    pub async fn dispatch(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let (_, executor) = self
            .entries
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        executor(arguments).await
    }

    /// Register the user-interaction tools. Their schemas are advertised to
    /// the LLM but the session loop intercepts the calls and parks on the
    /// question/permission rendezvous instead of dispatching here.
    pub fn register_interaction_tools(&mut self) {
        self.register(
            "askTextQuestion",
            ToolEntry::new(
                "Ask the user a free-form question and wait for their answer.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "question": {"type": "string", "description": "The question to ask"}
                    },
                    "required": ["question"]
                }),
            ),
            Arc::new(|_| {
                Box::pin(async {
                    Err(ToolError::Failed(
                        "askTextQuestion must be handled by the session loop".into(),
                    ))
                })
            }),
        );
        self.register(
            "askMultipleChoice",
            ToolEntry::new(
                "Ask the user to pick one of the given options and wait for their choice.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "question": {"type": "string"},
                        "options": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["question", "options"]
                }),
            ),
            Arc::new(|_| {
                Box::pin(async {
                    Err(ToolError::Failed(
                        "askMultipleChoice must be handled by the session loop".into(),
                    ))
                })
            }),
        );
    }
}

/// Extract a required string argument.
pub(crate) fn str_arg(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string field '{}'", key)))
}

/// Extract a required integer argument.
pub(crate) fn i64_arg(args: &Value, key: &str) -> Result<i64, ToolError> {
    args.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing integer field '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_executor() -> ToolExecutor {
        Arc::new(|args| Box::pin(async move { Ok(json!({"echo": args})) }))
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.dispatch("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn dispatch_runs_executor() {
        let mut registry = ToolRegistry::new();
        registry.register("echo", ToolEntry::new("echo", json!({})), echo_executor());
        let out = registry.dispatch("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out["echo"]["x"], 1);
    }

    #[test]
    fn llm_tools_excludes_internal() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "screenshot",
            ToolEntry::new("grab screen", json!({})).internal(),
            echo_executor(),
        );
        registry.register("openApp", ToolEntry::new("open app", json!({})), echo_executor());

        let tools = registry.llm_tools(&[]);
        let names: Vec<_> = tools.iter().map(|t| t.function.name.as_str()).collect();
        assert_eq!(names, vec!["openApp"]);
    }

    #[test]
    fn llm_tools_filters_by_skill() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "webSearch",
            ToolEntry::new("search", json!({})).with_skill("web"),
            echo_executor(),
        );
        registry.register("openApp", ToolEntry::new("open app", json!({})), echo_executor());

        assert_eq!(registry.llm_tools(&[]).len(), 1);
        assert_eq!(registry.llm_tools(&["web".to_string()]).len(), 2);
    }

    #[test]
    fn permission_gate_flag_is_exposed() {
        let mut registry = ToolRegistry::new();
        registry.register(
            "runShell",
            ToolEntry::new("run shell", json!({})).gated(),
            echo_executor(),
        );
        assert!(registry.requires_permission("runShell"));
        assert!(!registry.requires_permission("unknown"));
    }
}
