//! Tool dispatcher: registry, guest-RPC tools, host-side tools, MCP servers.

pub mod guest_tools;
pub mod local;
pub mod mcp;
pub mod registry;

pub use guest_tools::register_guest_tools;
pub use local::{register_local_tools, CredentialResolver};
pub use mcp::{register_mcp_server, McpServer, McpToolSpec};
pub use registry::{ToolEntry, ToolError, ToolExecutor, ToolRegistry};
