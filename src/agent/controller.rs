//! Agent control loop
//!
//! One controller drives one session against one VM. Each step: observe the
//! screen, fold in any instructions attached mid-run, ask the model for a
//! completion (raced against the cancel flag), then either finish on a
//! terminal answer or execute the returned tool calls strictly in order.
//!
//! Question and permission tools park the loop on a single-slot rendezvous
//! until an external caller answers through the `SessionHandle`. Pause takes
//! effect at step boundaries only; in-flight tool calls of the current step
//! complete first.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde_json::json;
use tracing::Instrument;
use uuid::Uuid;

use crate::llm::{ChatMessage, LlmProvider, ToolCall};
use crate::metrics::{LLM_CALL_DURATION, SESSION_STEPS, TOKENS_TOTAL, TOOL_CALLS_TOTAL};
use crate::tools::{ToolError, ToolRegistry};
use crate::trace::{TraceEvent, TraceEventKind, TraceWriter};
use crate::GuestTransport;

use super::gate::Controls;
use super::session::{AgentSession, PendingQuestion, SessionError, SessionState, TokenUsage};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an autonomous agent operating a computer \
inside an isolated virtual machine. Before every response you receive an observation of \
the current screen. Use the available tools to complete the task. Ask the user a question \
only when you are blocked. When the task is complete, respond with a plain-text summary \
and no tool calls.";

/// Per-session loop configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hard bound on loop iterations before the session fails
    pub max_steps: u64,
    pub system_prompt: String,
    /// Skills unlocking skill-scoped tools
    pub skills: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            skills: Vec::new(),
        }
    }
}

/// Terminal summary of one session run
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    pub steps: u64,
    pub tokens: TokenUsage,
    /// Final answer text on completion
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// External handle to a running session: snapshots and control operations.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<StdMutex<AgentSession>>,
    controls: Arc<Controls>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> AgentSession {
        self.session.lock().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().unwrap().state.clone()
    }

    /// Halt the loop at the next step boundary.
    pub fn pause(&self) {
        self.controls.pause();
    }

    pub fn resume(&self) {
        self.controls.resume();
    }

    /// Cancel the session; interrupts an in-flight LLM call and wakes any
    /// parked rendezvous.
    pub fn cancel(&self) {
        self.controls.cancel();
    }

    /// Answer a pending question. Returns false when no question is pending.
    pub fn answer_question(&self, answer: impl Into<String>) -> bool {
        self.controls.question.resolve(answer.into())
    }

    /// Grant or deny a pending permission request.
    pub fn resolve_permission(&self, granted: bool) -> bool {
        self.controls.permission.resolve(granted)
    }

    /// Attach an instruction folded into the next LLM request.
    pub fn add_instruction(&self, text: impl Into<String>) {
        self.controls.push_instruction(text);
    }
}

/// Outcome of one tool call as seen by the loop
enum ToolOutcome {
    /// Success payload fed back as a tool message
    Output(serde_json::Value),
    /// Tool-level failure fed back as a failed tool message
    Failure(String),
    Cancelled,
    /// Connection to the VM is gone; the session fails
    Fatal(String),
}

/// Drives one agent session to a terminal state
pub struct AgentController {
    session: Arc<StdMutex<AgentSession>>,
    controls: Arc<Controls>,
    provider: Arc<dyn LlmProvider>,
    registry: ToolRegistry,
    transport: Arc<GuestTransport>,
    trace: TraceWriter,
    config: AgentConfig,
}

impl AgentController {
    /// Create a controller and the external handle to it
    ///
    /// # Arguments
    /// * `task_id` - Task this session belongs to
    /// * `vm_id` - VM the transport is bound to
    /// * `provider` - Completion provider
    /// * `registry` - Tool set for this VM
    /// * `transport` - Bound guest transport
    /// * `trace` - Session trace writer
    pub fn new(
        task_id: impl Into<String>,
        vm_id: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        registry: ToolRegistry,
        transport: Arc<GuestTransport>,
        trace: TraceWriter,
        config: AgentConfig,
    ) -> (Self, SessionHandle) {
        let session_id = format!("sess-{}", Uuid::now_v7());
        let session = Arc::new(StdMutex::new(AgentSession::new(
            session_id, task_id, vm_id,
        )));
        let controls = Arc::new(Controls::new());

        let handle = SessionHandle {
            session: Arc::clone(&session),
            controls: Arc::clone(&controls),
        };
        let controller = Self {
            session,
            controls,
            provider,
            registry,
            transport,
            trace,
            config,
        };
        (controller, handle)
    }

    /// Run the loop to a terminal state. The VM lease is owned by the
    /// caller; it must be released whatever the outcome.
    pub async fn run(self, task: &str) -> SessionReport {
        let (session_id, task_id) = {
            let s = self.session.lock().unwrap();
            (s.id.clone(), s.task_id.clone())
        };
        let span =
            tracing::info_span!("agent_session", session_id = %session_id, task_id = %task_id);

        let (state, summary, error) = self.drive(task).instrument(span).await;

        let (steps, tokens) = {
            let mut s = self.session.lock().unwrap();
            s.state = state.clone();
            (s.step, s.tokens)
        };
        SESSION_STEPS.observe(steps as f64);
        self.record(
            steps,
            TraceEventKind::SessionEnd {
                state: state.as_str().to_string(),
                steps,
                total_tokens: tokens.total,
                summary: summary.clone(),
            },
        );
        tracing::info!(
            session_id = %session_id,
            state = state.as_str(),
            steps,
            total_tokens = tokens.total,
            "session finished"
        );

        SessionReport {
            session_id,
            state,
            steps,
            tokens,
            summary,
            error,
        }
    }

    async fn drive(&self, task: &str) -> (SessionState, Option<String>, Option<String>) {
        {
            let mut s = self.session.lock().unwrap();
            s.state = SessionState::Running;
            s.history.push(ChatMessage::system(&self.config.system_prompt));
            s.history.push(ChatMessage::user(task));
        }
        let (task_id, vm_id) = {
            let s = self.session.lock().unwrap();
            (s.task_id.clone(), s.vm_id.clone())
        };
        self.record(
            0,
            TraceEventKind::SessionStart {
                task_id,
                vm_id,
                model: self.provider.model().to_string(),
            },
        );

        loop {
            if self.controls.is_cancelled() {
                return (SessionState::Cancelled, None, None);
            }
            if self.controls.is_paused() {
                self.set_state(SessionState::Paused);
                tracing::info!("session paused");
                if self.controls.wait_while_paused().await {
                    return (SessionState::Cancelled, None, None);
                }
                self.set_state(SessionState::Running);
                tracing::info!("session resumed");
            }

            let step = self.session.lock().unwrap().step;
            if step >= self.config.max_steps {
                let err = SessionError::StepLimit(self.config.max_steps);
                self.record(
                    step,
                    TraceEventKind::Error {
                        message: err.to_string(),
                    },
                );
                return (SessionState::Failed, None, Some(err.to_string()));
            }

            // Observation
            match self.transport.screenshot().await {
                Ok(shot) => {
                    self.record(
                        step,
                        TraceEventKind::Observation {
                            format: shot.format.clone(),
                            width: shot.width,
                            height: shot.height,
                        },
                    );
                    self.push_history(ChatMessage::user(format!(
                        "[observation] screenshot {}x{} ({})",
                        shot.width, shot.height, shot.format
                    )));
                }
                Err(e) if e.is_fatal() => {
                    self.record(
                        step,
                        TraceEventKind::Error {
                            message: e.to_string(),
                        },
                    );
                    return (
                        SessionState::Failed,
                        None,
                        Some(SessionError::from(e).to_string()),
                    );
                }
                Err(e) => {
                    // Guest refused the capture; the model is told and may
                    // proceed without a fresh observation.
                    tracing::warn!(error = %e, "observation failed");
                    self.push_history(ChatMessage::user(format!(
                        "[observation unavailable: {}]",
                        e
                    )));
                }
            }

            // Instructions attached while the step was running
            for instruction in self.controls.drain_instructions() {
                self.record(
                    step,
                    TraceEventKind::UserIntervention {
                        kind: "instruction".to_string(),
                        detail: instruction.clone(),
                    },
                );
                self.push_history(ChatMessage::user(instruction));
            }

            // Completion, raced against cancel
            let tools = self.registry.llm_tools(&self.config.skills);
            let messages = self.session.lock().unwrap().history.clone();
            self.record(
                step,
                TraceEventKind::LlmRequest {
                    model: self.provider.model().to_string(),
                    message_count: messages.len(),
                    tool_count: tools.len(),
                },
            );
            let started = Instant::now();
            let response = tokio::select! {
                _ = self.controls.cancelled() => {
                    tracing::info!("cancelled during LLM call");
                    return (SessionState::Cancelled, None, None);
                }
                result = self.provider.chat(&messages, &tools) => result,
            };
            let elapsed = started.elapsed();
            LLM_CALL_DURATION
                .with_label_values(&[self.provider.model()])
                .observe(elapsed.as_secs_f64());

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    self.record(
                        step,
                        TraceEventKind::Error {
                            message: e.to_string(),
                        },
                    );
                    return (
                        SessionState::Failed,
                        None,
                        Some(SessionError::from(e).to_string()),
                    );
                }
            };

            {
                let mut s = self.session.lock().unwrap();
                s.tokens.add(&response.usage);
            }
            TOKENS_TOTAL
                .with_label_values(&["prompt"])
                .inc_by(response.usage.prompt_tokens as f64);
            TOKENS_TOTAL
                .with_label_values(&["completion"])
                .inc_by(response.usage.completion_tokens as f64);
            self.record_timed(
                step,
                TraceEventKind::LlmResponse {
                    content: response.message.content.clone(),
                    tool_call_count: response.tool_calls().len(),
                    prompt_tokens: response.usage.prompt_tokens,
                    completion_tokens: response.usage.completion_tokens,
                    total_tokens: response.usage.total_tokens,
                },
                elapsed.as_millis() as u64,
            );

            let calls: Vec<ToolCall> = response.tool_calls().to_vec();
            self.push_history(response.message.clone());

            if calls.is_empty() {
                // Terminal answer; the iteration still counts as a step.
                self.bump_step();
                return (
                    SessionState::Completed,
                    Some(response.message.content),
                    None,
                );
            }

            // Strictly in the order the model emitted them
            for call in &calls {
                match self.handle_tool_call(step, call).await {
                    ToolOutcome::Output(value) => {
                        self.push_history(ChatMessage::tool(&call.id, value.to_string()));
                    }
                    ToolOutcome::Failure(msg) => {
                        self.push_history(ChatMessage::tool(
                            &call.id,
                            json!({ "error": msg }).to_string(),
                        ));
                    }
                    ToolOutcome::Cancelled => return (SessionState::Cancelled, None, None),
                    ToolOutcome::Fatal(msg) => return (SessionState::Failed, None, Some(msg)),
                }
            }

            self.bump_step();
        }
    }

    async fn handle_tool_call(&self, step: u64, call: &ToolCall) -> ToolOutcome {
        let name = call.function.name.as_str();
        let args = call.function.arguments.clone();
        self.record(
            step,
            TraceEventKind::ToolCall {
                name: name.to_string(),
                arguments: args.clone(),
            },
        );

        // Question tools park on the rendezvous instead of dispatching.
        if name == "askTextQuestion" || name == "askMultipleChoice" {
            return self.handle_question(step, name, &args).await;
        }

        if self.registry.requires_permission(name) {
            match self.await_permission(step, name).await {
                Ok(true) => {}
                Ok(false) => {
                    TOOL_CALLS_TOTAL.with_label_values(&[name, "denied"]).inc();
                    return ToolOutcome::Failure(
                        ToolError::PermissionDenied(name.to_string()).to_string(),
                    );
                }
                Err(()) => return ToolOutcome::Cancelled,
            }
        }

        let started = Instant::now();
        match self.registry.dispatch(name, args).await {
            Ok(value) => {
                TOOL_CALLS_TOTAL.with_label_values(&[name, "ok"]).inc();
                self.record_timed(
                    step,
                    TraceEventKind::ToolResult {
                        name: name.to_string(),
                        success: true,
                        output: value.clone(),
                    },
                    started.elapsed().as_millis() as u64,
                );
                ToolOutcome::Output(value)
            }
            Err(e) if e.is_fatal() => {
                TOOL_CALLS_TOTAL.with_label_values(&[name, "error"]).inc();
                self.record(
                    step,
                    TraceEventKind::Error {
                        message: e.to_string(),
                    },
                );
                ToolOutcome::Fatal(e.to_string())
            }
            Err(e) => {
                TOOL_CALLS_TOTAL.with_label_values(&[name, "error"]).inc();
                self.record_timed(
                    step,
                    TraceEventKind::ToolResult {
                        name: name.to_string(),
                        success: false,
                        output: json!({ "error": e.to_string() }),
                    },
                    started.elapsed().as_millis() as u64,
                );
                ToolOutcome::Failure(e.to_string())
            }
        }
    }

    async fn handle_question(
        &self,
        step: u64,
        name: &str,
        args: &serde_json::Value,
    ) -> ToolOutcome {
        let question = args["question"].as_str().unwrap_or("").to_string();
        let options = if name == "askMultipleChoice" {
            args["options"].as_array().map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
        } else {
            None
        };

        // Arm before publishing: a caller that sees the question pending
        // must find the rendezvous ready to take its answer.
        let rx = self.controls.question.arm();
        {
            let mut s = self.session.lock().unwrap();
            s.pending_question = Some(PendingQuestion {
                question: question.clone(),
                options,
            });
        }
        tracing::info!(question = %question, "parked on user question");

        let answer = tokio::select! {
            _ = self.controls.cancelled() => None,
            res = rx => res.ok(),
        };
        self.session.lock().unwrap().pending_question = None;

        match answer {
            Some(answer) => {
                self.record(
                    step,
                    TraceEventKind::UserIntervention {
                        kind: "question_answered".to_string(),
                        detail: answer.clone(),
                    },
                );
                TOOL_CALLS_TOTAL.with_label_values(&[name, "ok"]).inc();
                ToolOutcome::Output(json!({ "answer": answer }))
            }
            None => ToolOutcome::Cancelled,
        }
    }

    /// Park until the user grants or denies. `Err(())` means cancelled.
    async fn await_permission(&self, step: u64, name: &str) -> Result<bool, ()> {
        // Same ordering as questions: arm, then publish.
        let rx = self.controls.permission.arm();
        self.session.lock().unwrap().pending_permission = Some(name.to_string());
        tracing::info!(tool = name, "parked on permission request");

        let granted = tokio::select! {
            _ = self.controls.cancelled() => None,
            res = rx => res.ok(),
        };
        self.session.lock().unwrap().pending_permission = None;

        match granted {
            Some(granted) => {
                self.record(
                    step,
                    TraceEventKind::UserIntervention {
                        kind: if granted {
                            "permission_granted".to_string()
                        } else {
                            "permission_denied".to_string()
                        },
                        detail: name.to_string(),
                    },
                );
                Ok(granted)
            }
            None => Err(()),
        }
    }

    fn set_state(&self, state: SessionState) {
        self.session.lock().unwrap().state = state;
    }

    fn push_history(&self, message: ChatMessage) {
        self.session.lock().unwrap().history.push(message);
    }

    fn bump_step(&self) {
        self.session.lock().unwrap().step += 1;
    }

    fn record(&self, step: u64, kind: TraceEventKind) {
        let session_id = self.session.lock().unwrap().id.clone();
        let event = TraceEvent::new(session_id, step, kind);
        if let Err(e) = self.trace.append(&event) {
            tracing::warn!(error = %e, "trace append failed");
        }
    }

    fn record_timed(&self, step: u64, kind: TraceEventKind, duration_ms: u64) {
        let session_id = self.session.lock().unwrap().id.clone();
        let event = TraceEvent::new(session_id, step, kind).with_duration(duration_ms);
        if let Err(e) = self.trace.append(&event) {
            tracing::warn!(error = %e, "trace append failed");
        }
    }
}
