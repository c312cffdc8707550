//! Agent session state

use serde::Serialize;

use crate::guest::TransportError;
use crate::llm::{ChatError, ChatMessage, Usage};

/// Lifecycle of one agent session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }
}

/// Accumulated token counts; only ever grows.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, usage: &Usage) {
        self.prompt += usage.prompt_tokens;
        self.completion += usage.completion_tokens;
        self.total += usage.total_tokens;
    }
}

/// A question the loop is parked on, waiting for a user answer
#[derive(Debug, Clone, Serialize)]
pub struct PendingQuestion {
    pub question: String,
    /// Set for multiple-choice questions
    pub options: Option<Vec<String>>,
}

/// State of one agent session, owned by its controller; external callers
/// see snapshots through the `SessionHandle`.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub id: String,
    pub task_id: String,
    pub vm_id: String,
    pub state: SessionState,
    /// Completed loop iterations
    pub step: u64,
    pub tokens: TokenUsage,
    pub pending_question: Option<PendingQuestion>,
    /// Tool name waiting on a permission grant
    pub pending_permission: Option<String>,
    pub history: Vec<ChatMessage>,
}

impl AgentSession {
    pub fn new(
        id: impl Into<String>,
        task_id: impl Into<String>,
        vm_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            vm_id: vm_id.into(),
            state: SessionState::Idle,
            step: 0,
            tokens: TokenUsage::default(),
            pending_question: None,
            pending_permission: None,
            history: Vec::new(),
        }
    }
}

/// Error type for session failures
#[derive(Debug)]
pub enum SessionError {
    Llm(ChatError),
    Transport(TransportError),
    /// Step budget exhausted without a terminal answer
    StepLimit(u64),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Llm(e) => write!(f, "LLM error: {}", e),
            SessionError::Transport(e) => write!(f, "transport error: {}", e),
            SessionError::StepLimit(n) => {
                write!(f, "step limit of {} reached without completion", n)
            }
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ChatError> for SessionError {
    fn from(e: ChatError) -> Self {
        SessionError::Llm(e)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Paused.is_terminal());
    }

    #[test]
    fn token_usage_accumulates() {
        let mut tokens = TokenUsage::default();
        tokens.add(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        tokens.add(&Usage {
            prompt_tokens: 20,
            completion_tokens: 1,
            total_tokens: 21,
        });
        assert_eq!(tokens.prompt, 30);
        assert_eq!(tokens.completion, 6);
        assert_eq!(tokens.total, 36);
    }
}
