//! Agent control loop: session state, control plumbing, and the controller
//! that drives one session against one VM.

pub mod controller;
pub mod gate;
pub mod session;

pub use controller::{AgentConfig, AgentController, SessionHandle, SessionReport};
pub use gate::{Controls, Rendezvous};
pub use session::{AgentSession, PendingQuestion, SessionError, SessionState, TokenUsage};
