//! Task orchestration: persisted tasks, admission control, copy fan-out.

pub mod service;
pub mod store;

pub use service::{Orchestrator, OrchestratorConfig, OrchestratorError, TaskSpec, ToolsFactory};
pub use store::{JsonTaskStore, StoreError, Task, TaskStatus, TaskStore};
