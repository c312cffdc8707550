//! Task orchestration
//!
//! Fans a task out into `copy_count` independent runner sessions, each with
//! its own VM, history and trace. A semaphore bounds how many sessions run
//! at once; extra copies stay queued holding nothing. The VM lease is
//! released on every exit path, and the persisted task gets one aggregate
//! terminal status once all copies finish.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Semaphore;
use tokio::time::Duration;
use uuid::Uuid;

use crate::agent::{AgentConfig, AgentController, SessionHandle, SessionReport, SessionState};
use crate::guest::GuestTransport;
use crate::metrics::TASKS_TOTAL;
use crate::tools::ToolRegistry;
use crate::trace::TraceWriter;
use crate::vm::{VmSource, VmTarget};

use super::store::{StoreError, Task, TaskStatus, TaskStore};
use crate::llm::LlmProvider;

/// Builds the tool registry for one leased VM's transport. Registries bind
/// executors to a specific transport, so each session gets a fresh one.
pub type ToolsFactory = Arc<dyn Fn(Arc<GuestTransport>) -> ToolRegistry + Send + Sync>;

/// Error type for orchestration operations
#[derive(Debug)]
pub enum OrchestratorError {
    InvalidSpec(String),
    Store(StoreError),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::InvalidSpec(msg) => write!(f, "invalid task spec: {}", msg),
            OrchestratorError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Store(e)
    }
}

/// Submission payload for a new task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub description: String,
    pub provider: String,
    pub model: String,
    /// Independent copies to fan out; each gets its own VM and history
    pub copy_count: u32,
    pub attachments: Vec<String>,
    /// Target a specific retained VM instead of the ephemeral pool
    pub vm_id: Option<String>,
    /// Skills unlocking skill-scoped tools for the sessions
    pub skills: Vec<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            provider: provider.into(),
            model: model.into(),
            copy_count: 1,
            attachments: Vec::new(),
            vm_id: None,
            skills: Vec::new(),
        }
    }
}

/// Orchestrator configuration
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Sessions allowed to run concurrently across all tasks
    pub max_concurrent: usize,
    pub traces_dir: PathBuf,
    pub output_root: PathBuf,
    pub agent: AgentConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            traces_dir: PathBuf::from("./traces"),
            output_root: PathBuf::from("./outputs"),
            agent: AgentConfig::default(),
        }
    }
}

/// Task orchestration service
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    vms: Arc<dyn VmSource>,
    provider: Arc<dyn LlmProvider>,
    tools_factory: ToolsFactory,
    semaphore: Arc<Semaphore>,
    /// Session handles of live copies, keyed by task id
    handles: StdMutex<HashMap<String, Vec<SessionHandle>>>,
    /// Tasks cancelled while copies were still queued
    cancelled: StdMutex<HashSet<String>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        vms: Arc<dyn VmSource>,
        provider: Arc<dyn LlmProvider>,
        tools_factory: ToolsFactory,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            vms,
            provider,
            tools_factory,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            handles: StdMutex::new(HashMap::new()),
            cancelled: StdMutex::new(HashSet::new()),
            config,
        })
    }

    /// Validate, persist and fan out a new task. Returns its id; the copies
    /// run in the background.
    pub async fn create_task(self: &Arc<Self>, spec: TaskSpec) -> Result<String, OrchestratorError> {
        if spec.description.trim().is_empty() {
            return Err(OrchestratorError::InvalidSpec("empty description".into()));
        }
        if spec.copy_count == 0 {
            return Err(OrchestratorError::InvalidSpec("copy_count must be >= 1".into()));
        }
        if spec.provider.trim().is_empty() || spec.model.trim().is_empty() {
            return Err(OrchestratorError::InvalidSpec(
                "provider and model are required".into(),
            ));
        }
        if spec.copy_count > 1 && spec.vm_id.is_some() {
            return Err(OrchestratorError::InvalidSpec(
                "a targeted VM cannot run multiple copies".into(),
            ));
        }

        let task_id = format!("task-{}", Uuid::now_v7());
        let output_dir = self.config.output_root.join(&task_id);
        std::fs::create_dir_all(&output_dir).map_err(StoreError::Io)?;

        let mut task = Task::new(
            &task_id,
            &spec.description,
            &spec.provider,
            &spec.model,
            spec.copy_count,
            output_dir,
        );
        task.attachments = spec.attachments.clone();
        self.store.insert(&task).await?;
        tracing::info!(task_id = %task_id, copies = spec.copy_count, "task created");

        let results: Arc<StdMutex<Vec<SessionReport>>> =
            Arc::new(StdMutex::new(Vec::with_capacity(spec.copy_count as usize)));
        for copy in 0..spec.copy_count {
            let this = Arc::clone(self);
            let spec = spec.clone();
            let task_id = task_id.clone();
            let results = Arc::clone(&results);
            tokio::spawn(async move {
                this.run_copy(task_id, copy, spec, results).await;
            });
        }

        Ok(task_id)
    }

    async fn run_copy(
        self: Arc<Self>,
        task_id: String,
        copy: u32,
        spec: TaskSpec,
        results: Arc<StdMutex<Vec<SessionReport>>>,
    ) {
        // Admission: a permit gates the whole session, so at most
        // max_concurrent copies are Running at any time.
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.finish_copy(
                    &task_id,
                    unstarted_report(&task_id, copy, SessionState::Failed, "admission closed"),
                    &results,
                    spec.copy_count,
                )
                .await;
                return;
            }
        };

        if self.cancelled.lock().unwrap().contains(&task_id) {
            drop(permit);
            self.finish_copy(
                &task_id,
                unstarted_report(&task_id, copy, SessionState::Cancelled, "cancelled while queued"),
                &results,
                spec.copy_count,
            )
            .await;
            return;
        }

        let target = match &spec.vm_id {
            Some(id) => VmTarget::Named(id.clone()),
            None => VmTarget::Ephemeral,
        };
        let lease = match self.vms.acquire(target).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(task_id = %task_id, copy, error = %e, "VM acquisition failed");
                drop(permit);
                self.finish_copy(
                    &task_id,
                    unstarted_report(&task_id, copy, SessionState::Failed, &e.to_string()),
                    &results,
                    spec.copy_count,
                )
                .await;
                return;
            }
        };

        // Record the assignment and flip the task to Running on the first
        // copy to start.
        if let Ok(mut task) = self.store.get(&task_id).await {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Running;
                task.vm_ids.push(lease.vm_id.clone());
                if let Err(e) = self.store.update(&task).await {
                    tracing::warn!(task_id = %task_id, error = %e, "task update failed");
                }
            }
        }

        let trace_path = self
            .config
            .traces_dir
            .join(format!("{}-{}.ndjson", task_id, copy));
        let trace = match TraceWriter::open(trace_path) {
            Ok(trace) => trace,
            Err(e) => {
                self.vms.release(lease).await;
                drop(permit);
                self.finish_copy(
                    &task_id,
                    unstarted_report(&task_id, copy, SessionState::Failed, &e.to_string()),
                    &results,
                    spec.copy_count,
                )
                .await;
                return;
            }
        };

        let mut agent_config = self.config.agent.clone();
        agent_config.skills = spec.skills.clone();
        let registry = (self.tools_factory)(Arc::clone(&lease.transport));
        let (controller, handle) = AgentController::new(
            &task_id,
            &lease.vm_id,
            Arc::clone(&self.provider),
            registry,
            Arc::clone(&lease.transport),
            trace,
            agent_config,
        );
        self.handles
            .lock()
            .unwrap()
            .entry(task_id.clone())
            .or_default()
            .push(handle.clone());

        // A cancel that landed while the VM was being acquired found no
        // handle to reach; honor the flag now that one exists.
        if self.cancelled.lock().unwrap().contains(&task_id) {
            handle.cancel();
        }

        let report = controller.run(&spec.description).await;

        // Release is unconditional: partial outputs in the task's output
        // directory survive, the VM never leaks.
        self.vms.release(lease).await;
        drop(permit);

        self.finish_copy(&task_id, report, &results, spec.copy_count).await;
    }

    async fn finish_copy(
        &self,
        task_id: &str,
        report: SessionReport,
        results: &Arc<StdMutex<Vec<SessionReport>>>,
        copy_count: u32,
    ) {
        let finished = {
            let mut r = results.lock().unwrap();
            r.push(report);
            r.len() as u32
        };
        if finished == copy_count {
            let reports = results.lock().unwrap().clone();
            self.finalize(task_id, &reports).await;
        }
    }

    /// Aggregate terminal status: any failure dominates, then cancellation,
    /// otherwise completed.
    async fn finalize(&self, task_id: &str, reports: &[SessionReport]) {
        let status = if reports.iter().any(|r| r.state == SessionState::Failed) {
            TaskStatus::Failed
        } else if reports.iter().any(|r| r.state == SessionState::Cancelled) {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Completed
        };
        let summary = reports.iter().find_map(|r| r.summary.clone());
        let error = reports.iter().find_map(|r| r.error.clone());

        match self.store.get(task_id).await {
            Ok(mut task) => {
                task.status = status.clone();
                task.summary = summary;
                task.error = error;
                if let Err(e) = self.store.update(&task).await {
                    tracing::warn!(task_id, error = %e, "final task update failed");
                }
            }
            Err(e) => tracing::warn!(task_id, error = %e, "task vanished before finalize"),
        }

        TASKS_TOTAL.with_label_values(&[status.as_str()]).inc();
        self.handles.lock().unwrap().remove(task_id);
        self.cancelled.lock().unwrap().remove(task_id);
        tracing::info!(task_id, status = status.as_str(), "task finalized");
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, OrchestratorError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, OrchestratorError> {
        Ok(self.store.list().await?)
    }

    /// Poll the store until the task reaches a terminal status.
    pub async fn wait_for_task(&self, id: &str) -> Result<Task, OrchestratorError> {
        loop {
            let task = self.store.get(id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Pause every live copy at its next step boundary.
    pub async fn pause_task(&self, id: &str) -> Result<(), OrchestratorError> {
        for handle in self.task_handles(id) {
            handle.pause();
        }
        let mut task = self.store.get(id).await?;
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Paused;
            self.store.update(&task).await?;
        }
        Ok(())
    }

    pub async fn resume_task(&self, id: &str) -> Result<(), OrchestratorError> {
        for handle in self.task_handles(id) {
            handle.resume();
        }
        let mut task = self.store.get(id).await?;
        if task.status == TaskStatus::Paused {
            task.status = TaskStatus::Running;
            self.store.update(&task).await?;
        }
        Ok(())
    }

    /// Cancel every copy: running sessions are interrupted, queued copies
    /// never start. The terminal status lands when the copies finish.
    pub async fn cancel_task(&self, id: &str) -> Result<(), OrchestratorError> {
        // Verify the task exists before flagging it.
        let _ = self.store.get(id).await?;
        self.cancelled.lock().unwrap().insert(id.to_string());
        for handle in self.task_handles(id) {
            handle.cancel();
        }
        tracing::info!(task_id = id, "task cancel requested");
        Ok(())
    }

    /// Answer the pending question of whichever copy is parked on one.
    /// Returns false when no copy is waiting.
    pub fn answer_question(&self, task_id: &str, answer: impl Into<String>) -> bool {
        let answer = answer.into();
        for handle in self.task_handles(task_id) {
            if handle.answer_question(answer.clone()) {
                return true;
            }
        }
        false
    }

    /// Grant or deny the pending permission request of a parked copy.
    pub fn resolve_permission(&self, task_id: &str, granted: bool) -> bool {
        for handle in self.task_handles(task_id) {
            if handle.resolve_permission(granted) {
                return true;
            }
        }
        false
    }

    /// Live session handles of a task's copies.
    pub fn task_handles(&self, task_id: &str) -> Vec<SessionHandle> {
        self.handles
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn unstarted_report(task_id: &str, copy: u32, state: SessionState, error: &str) -> SessionReport {
    SessionReport {
        session_id: format!("sess-unstarted-{}-{}", task_id, copy),
        state: state.clone(),
        steps: 0,
        tokens: Default::default(),
        summary: None,
        error: if state == SessionState::Cancelled {
            None
        } else {
            Some(error.to_string())
        },
    }
}
