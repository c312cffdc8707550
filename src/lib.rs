//! AgentVisor - dispatches autonomous LLM agents into ephemeral VMs
//!
//! This library provides the orchestration core for running tool-calling
//! agents inside isolated virtual machines: VM lifecycle management via a
//! privileged helper process, a JSON-RPC transport to the in-guest agent,
//! the agent control loop, and the task orchestration layer above it.
//!
//! # Modules
//!
//! - `vm` - VM lifecycle management (boot/stop/delete/clone) and the VM pool
//! - `guest` - JSON-RPC transport to the guest agent daemon
//! - `llm` - chat-completion client with tool calling
//! - `tools` - tool registry mapping tool names to executors
//! - `agent` - the agent control loop and session state
//! - `trace` - append-only per-session trace log
//! - `orchestrator` - task admission, copy fan-out, and persistence
//! - `metrics` - Prometheus metrics for observability
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use agentvisor::vm::{HelperClient, VmManager, VmManagerConfig, VmPool, VmSource, VmTarget};
//!
//! let helper = HelperClient::new("/var/run/agentvisor-helper.sock");
//! let manager = VmManager::new(Arc::new(helper), VmManagerConfig::default());
//! let pool = VmPool::new(Arc::new(manager), "golden", 4);
//! let lease = pool.acquire(VmTarget::Ephemeral).await?;
//! ```

pub mod agent;
pub mod guest;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod tools;
pub mod trace;
pub mod tracing;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentController, AgentSession, SessionHandle, SessionState};
pub use guest::{GuestTransport, TransportConfig, TransportError};
pub use orchestrator::{Orchestrator, Task, TaskSpec, TaskStatus};
pub use vm::{VmError, VmManager, VmPool, VmStatus};
