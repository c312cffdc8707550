//! Typed wrappers for the guest agent method set
//!
//! Parameter names follow the guest agent's wire schema (camelCase). A
//! guest-side refusal surfaces as `TransportError::Rpc`; only connection
//! loss is fatal to the calling session.

use serde::Deserialize;
use serde_json::{json, Value};

use super::transport::{GuestTransport, TransportError};

/// Screenshot of the guest display, base64-encoded
#[derive(Debug, Clone, Deserialize)]
pub struct Screenshot {
    pub format: String,
    pub data: String,
    pub width: u32,
    pub height: u32,
}

/// Output of a shell command run inside the guest
#[derive(Debug, Clone, Deserialize)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

/// One entry from a directory listing
#[derive(Debug, Clone, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    pub size: u64,
}

/// Guest agent liveness report
#[derive(Debug, Clone, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(rename = "uptimeSecs", default)]
    pub uptime_secs: u64,
    #[serde(rename = "agentVersion", default)]
    pub agent_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    fn as_str(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value)
        .map_err(|e| TransportError::Protocol(format!("bad {} result: {}", method, e)))
}

impl GuestTransport {
    pub async fn screenshot(&self) -> Result<Screenshot, TransportError> {
        let value = self.call("screenshot", json!({})).await?;
        parse("screenshot", value)
    }

    pub async fn open_app(&self, name: &str) -> Result<(), TransportError> {
        self.call("openApp", json!({ "name": name })).await.map(|_| ())
    }

    pub async fn open_url(&self, url: &str) -> Result<(), TransportError> {
        self.call("openUrl", json!({ "url": url })).await.map(|_| ())
    }

    pub async fn activate_app(&self, name: &str) -> Result<(), TransportError> {
        self.call("activateApp", json!({ "name": name }))
            .await
            .map(|_| ())
    }

    pub async fn mouse_move(&self, x: i32, y: i32) -> Result<(), TransportError> {
        self.call("mouseMove", json!({ "x": x, "y": y }))
            .await
            .map(|_| ())
    }

    pub async fn mouse_click(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
    ) -> Result<(), TransportError> {
        self.call(
            "mouseClick",
            json!({ "x": x, "y": y, "button": button.as_str() }),
        )
        .await
        .map(|_| ())
    }

    pub async fn mouse_drag(
        &self,
        from_x: i32,
        from_y: i32,
        to_x: i32,
        to_y: i32,
    ) -> Result<(), TransportError> {
        self.call(
            "mouseDrag",
            json!({ "fromX": from_x, "fromY": from_y, "toX": to_x, "toY": to_y }),
        )
        .await
        .map(|_| ())
    }

    pub async fn keyboard_type(&self, text: &str) -> Result<(), TransportError> {
        self.call("keyboardType", json!({ "text": text }))
            .await
            .map(|_| ())
    }

    pub async fn keyboard_key(&self, key: &str, modifiers: &[&str]) -> Result<(), TransportError> {
        self.call("keyboardKey", json!({ "key": key, "modifiers": modifiers }))
            .await
            .map(|_| ())
    }

    pub async fn scroll(
        &self,
        x: i32,
        y: i32,
        delta_x: i32,
        delta_y: i32,
    ) -> Result<(), TransportError> {
        self.call(
            "scroll",
            json!({ "x": x, "y": y, "deltaX": delta_x, "deltaY": delta_y }),
        )
        .await
        .map(|_| ())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, TransportError> {
        let value = self.call("readFile", json!({ "path": path })).await?;
        value["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| TransportError::Protocol("readFile result missing content".into()))
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), TransportError> {
        self.call("writeFile", json!({ "path": path, "content": content }))
            .await
            .map(|_| ())
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, TransportError> {
        let value = self.call("listDirectory", json!({ "path": path })).await?;
        parse("listDirectory", value["entries"].clone())
    }

    pub async fn move_file(&self, source: &str, destination: &str) -> Result<(), TransportError> {
        self.call(
            "moveFile",
            json!({ "source": source, "destination": destination }),
        )
        .await
        .map(|_| ())
    }

    pub async fn run_shell(
        &self,
        command: &str,
        timeout_secs: u32,
    ) -> Result<ShellOutput, TransportError> {
        let value = self
            .call(
                "runShell",
                json!({ "command": command, "timeoutSecs": timeout_secs }),
            )
            .await?;
        parse("runShell", value)
    }

    pub async fn clipboard_read(&self) -> Result<String, TransportError> {
        let value = self.call("clipboardRead", json!({})).await?;
        value["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| TransportError::Protocol("clipboardRead result missing text".into()))
    }

    pub async fn clipboard_write(&self, text: &str) -> Result<(), TransportError> {
        self.call("clipboardWrite", json!({ "text": text }))
            .await
            .map(|_| ())
    }

    pub async fn health_check(&self) -> Result<HealthReport, TransportError> {
        let value = self.call("healthCheck", json!({})).await?;
        parse("healthCheck", value)
    }

    /// Ask the guest OS to shut itself down cleanly.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        self.call("shutdown", json!({})).await.map(|_| ())
    }
}
