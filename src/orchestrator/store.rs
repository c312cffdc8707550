//! Persisted tasks
//!
//! One pretty-printed JSON file per task id. A terminal status is immutable:
//! `update` refuses to overwrite a task that already finished.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Task lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One persisted task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub provider: String,
    pub model: String,
    /// Independent copies fanned out for this task
    pub copy_count: u32,
    /// VMs assigned to the copies, filled in as they acquire
    pub vm_ids: Vec<String>,
    pub attachments: Vec<String>,
    pub output_dir: PathBuf,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        copy_count: u32,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Queued,
            provider: provider.into(),
            model: model.into(),
            copy_count,
            vm_ids: Vec::new(),
            attachments: Vec::new(),
            output_dir: output_dir.into(),
            created_at: now,
            updated_at: now,
            summary: None,
            error: None,
        }
    }
}

/// Error type for task persistence
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    NotFound(String),
    /// Attempted mutation of a task already in a terminal status
    TerminalState(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Serde(e) => write!(f, "serialization error: {}", e),
            StoreError::NotFound(id) => write!(f, "task not found: {}", id),
            StoreError::TerminalState(id) => {
                write!(f, "task {} already finished and cannot change", id)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

/// Task persistence seam
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    /// Persist a mutation. Refused once the stored status is terminal.
    async fn update(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Task, StoreError>;

    async fn list(&self) -> Result<Vec<Task>, StoreError>;
}

/// File-per-task JSON store
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(&self, path: &Path) -> Result<Task, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write(&self, task: &Task) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(task)?;
        std::fs::write(self.path_for(&task.id), json)?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let mut task = task.clone();
        task.updated_at = now_ms();
        self.write(&task)
    }

    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        let path = self.path_for(&task.id);
        if !path.is_file() {
            return Err(StoreError::NotFound(task.id.clone()));
        }
        let stored = self.read(&path)?;
        if stored.status.is_terminal() && stored.status != task.status {
            return Err(StoreError::TerminalState(task.id.clone()));
        }
        let mut task = task.clone();
        task.updated_at = now_ms();
        self.write(&task)
    }

    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        let path = self.path_for(id);
        if !path.is_file() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.read(&path)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task file");
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}
