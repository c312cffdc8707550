//! Session trace log
//!
//! Append-only NDJSON, one event per line, one file per session. Events are
//! never rewritten; readers tolerate a corrupt trailing line left by an
//! interrupted write. Field names follow the app's camelCase trace schema.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event taxonomy; the `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TraceEventKind {
    SessionStart {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "vmId")]
        vm_id: String,
        model: String,
    },
    SessionEnd {
        state: String,
        steps: u64,
        #[serde(rename = "totalTokens")]
        total_tokens: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    Observation {
        format: String,
        width: u32,
        height: u32,
    },
    LlmRequest {
        model: String,
        #[serde(rename = "messageCount")]
        message_count: usize,
        #[serde(rename = "toolCount")]
        tool_count: usize,
    },
    LlmResponse {
        content: String,
        #[serde(rename = "toolCallCount")]
        tool_call_count: usize,
        #[serde(rename = "promptTokens")]
        prompt_tokens: u64,
        #[serde(rename = "completionTokens")]
        completion_tokens: u64,
        #[serde(rename = "totalTokens")]
        total_tokens: u64,
    },
    ToolCall {
        name: String,
        arguments: Value,
    },
    ToolResult {
        name: String,
        success: bool,
        output: Value,
    },
    UserIntervention {
        kind: String,
        detail: String,
    },
    Error {
        message: String,
    },
}

/// One line of the session trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub step: u64,
    #[serde(rename = "durationMs", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub kind: TraceEventKind,
}

impl TraceEvent {
    pub fn new(session_id: impl Into<String>, step: u64, kind: TraceEventKind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            session_id: session_id.into(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            step,
            duration_ms: None,
            kind,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Appending writer for one session's trace file
pub struct TraceWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl TraceWriter {
    /// Open (or create) the trace file for appending.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and flush so a crash loses at most the line being
    /// written.
    pub fn append(&self, event: &TraceEvent) -> std::io::Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{}", line)?;
        file.flush()
    }
}

/// Read a trace file back. Undecodable lines (a torn trailing write) are
/// skipped with a warning rather than failing the whole read.
pub fn read_trace(path: impl AsRef<Path>) -> std::io::Result<Vec<TraceEvent>> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!(
                    path = %path.as_ref().display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping undecodable trace line"
                );
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_events() -> Vec<TraceEvent> {
        vec![
            TraceEvent::new(
                "sess-1",
                0,
                TraceEventKind::SessionStart {
                    task_id: "task-1".into(),
                    vm_id: "vm-1".into(),
                    model: "gpt-test".into(),
                },
            ),
            TraceEvent::new(
                "sess-1",
                1,
                TraceEventKind::Observation {
                    format: "png".into(),
                    width: 1280,
                    height: 800,
                },
            ),
            TraceEvent::new(
                "sess-1",
                1,
                TraceEventKind::LlmRequest {
                    model: "gpt-test".into(),
                    message_count: 3,
                    tool_count: 12,
                },
            ),
            TraceEvent::new(
                "sess-1",
                1,
                TraceEventKind::LlmResponse {
                    content: "clicking".into(),
                    tool_call_count: 1,
                    prompt_tokens: 100,
                    completion_tokens: 20,
                    total_tokens: 120,
                },
            )
            .with_duration(1500),
            TraceEvent::new(
                "sess-1",
                1,
                TraceEventKind::ToolCall {
                    name: "mouseClick".into(),
                    arguments: json!({"x": 10, "y": 20}),
                },
            ),
            TraceEvent::new(
                "sess-1",
                1,
                TraceEventKind::ToolResult {
                    name: "mouseClick".into(),
                    success: true,
                    output: json!({"ok": true}),
                },
            ),
            TraceEvent::new(
                "sess-1",
                2,
                TraceEventKind::UserIntervention {
                    kind: "question_answered".into(),
                    detail: "use the blue account".into(),
                },
            ),
            TraceEvent::new(
                "sess-1",
                3,
                TraceEventKind::Error {
                    message: "transport disconnected".into(),
                },
            ),
            TraceEvent::new(
                "sess-1",
                3,
                TraceEventKind::SessionEnd {
                    state: "failed".into(),
                    steps: 3,
                    total_tokens: 120,
                    summary: None,
                },
            ),
        ]
    }

    #[test]
    fn every_variant_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sess-1.ndjson");
        let writer = TraceWriter::open(&path).unwrap();

        let events = sample_events();
        for event in &events {
            writer.append(event).unwrap();
        }

        let read_back = read_trace(&path).unwrap();
        assert_eq!(read_back, events);
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let event = TraceEvent::new(
            "sess-1",
            2,
            TraceEventKind::LlmResponse {
                content: "".into(),
                tool_call_count: 0,
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            },
        )
        .with_duration(7);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["sessionId"], "sess-1");
        assert_eq!(value["type"], "llm_response");
        assert_eq!(value["data"]["totalTokens"], 3);
        assert_eq!(value["durationMs"], 7);
    }

    #[test]
    fn corrupt_trailing_line_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sess-2.ndjson");
        let writer = TraceWriter::open(&path).unwrap();

        let events = sample_events();
        for event in &events {
            writer.append(event).unwrap();
        }
        // Simulate a torn write at the end of the file.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"id\":\"trunc").unwrap();
        }

        let read_back = read_trace(&path).unwrap();
        assert_eq!(read_back, events);
    }

    #[test]
    fn steps_are_monotonic_in_file_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sess-3.ndjson");
        let writer = TraceWriter::open(&path).unwrap();
        for event in sample_events() {
            writer.append(&event).unwrap();
        }
        let read_back = read_trace(&path).unwrap();
        let steps: Vec<u64> = read_back.iter().map(|e| e.step).collect();
        let mut sorted = steps.clone();
        sorted.sort();
        assert_eq!(steps, sorted);
    }
}
