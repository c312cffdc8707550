//! Guest-RPC-backed tools
//!
//! One executor per guest agent method, closed over the session's transport.
//! `screenshot` and `healthCheck` are registered internal-only: the loop uses
//! them for observations and liveness, the LLM never calls them directly.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::guest::{GuestTransport, MouseButton};

use super::registry::{i64_arg, str_arg, ToolEntry, ToolError, ToolRegistry};

fn obj_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Register the full guest tool set against one VM's transport.
pub fn register_guest_tools(registry: &mut ToolRegistry, transport: Arc<GuestTransport>) {
    let t = Arc::clone(&transport);
    registry.register(
        "screenshot",
        ToolEntry::new("Capture the guest display.", obj_schema(json!({}), &[])).internal(),
        Arc::new(move |_| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let shot = t.screenshot().await?;
                Ok(json!({
                    "format": shot.format,
                    "data": shot.data,
                    "width": shot.width,
                    "height": shot.height,
                }))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "healthCheck",
        ToolEntry::new("Check guest agent liveness.", obj_schema(json!({}), &[])).internal(),
        Arc::new(move |_| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let report = t.health_check().await?;
                Ok(json!({"status": report.status, "uptimeSecs": report.uptime_secs}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "openApp",
        ToolEntry::new(
            "Open an application by name in the guest.",
            obj_schema(json!({"name": {"type": "string"}}), &["name"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.open_app(&str_arg(&args, "name")?).await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "openUrl",
        ToolEntry::new(
            "Open a URL in the guest's default browser.",
            obj_schema(json!({"url": {"type": "string"}}), &["url"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.open_url(&str_arg(&args, "url")?).await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "activateApp",
        ToolEntry::new(
            "Bring an already-running application to the foreground.",
            obj_schema(json!({"name": {"type": "string"}}), &["name"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.activate_app(&str_arg(&args, "name")?).await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "mouseMove",
        ToolEntry::new(
            "Move the mouse cursor to screen coordinates.",
            obj_schema(
                json!({"x": {"type": "integer"}, "y": {"type": "integer"}}),
                &["x", "y"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.mouse_move(i64_arg(&args, "x")? as i32, i64_arg(&args, "y")? as i32)
                    .await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "mouseClick",
        ToolEntry::new(
            "Click at screen coordinates.",
            obj_schema(
                json!({
                    "x": {"type": "integer"},
                    "y": {"type": "integer"},
                    "button": {"type": "string", "enum": ["left", "right", "middle"]}
                }),
                &["x", "y"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let button = match args.get("button").and_then(|b| b.as_str()) {
                    Some("right") => MouseButton::Right,
                    Some("middle") => MouseButton::Middle,
                    _ => MouseButton::Left,
                };
                t.mouse_click(
                    i64_arg(&args, "x")? as i32,
                    i64_arg(&args, "y")? as i32,
                    button,
                )
                .await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "mouseDrag",
        ToolEntry::new(
            "Drag the mouse from one point to another.",
            obj_schema(
                json!({
                    "fromX": {"type": "integer"}, "fromY": {"type": "integer"},
                    "toX": {"type": "integer"}, "toY": {"type": "integer"}
                }),
                &["fromX", "fromY", "toX", "toY"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.mouse_drag(
                    i64_arg(&args, "fromX")? as i32,
                    i64_arg(&args, "fromY")? as i32,
                    i64_arg(&args, "toX")? as i32,
                    i64_arg(&args, "toY")? as i32,
                )
                .await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "keyboardType",
        ToolEntry::new(
            "Type text into the focused element.",
            obj_schema(json!({"text": {"type": "string"}}), &["text"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.keyboard_type(&str_arg(&args, "text")?).await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "keyboardKey",
        ToolEntry::new(
            "Press a key with optional modifiers (cmd, shift, alt, ctrl).",
            obj_schema(
                json!({
                    "key": {"type": "string"},
                    "modifiers": {"type": "array", "items": {"type": "string"}}
                }),
                &["key"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let key = str_arg(&args, "key")?;
                let modifiers: Vec<String> = args
                    .get("modifiers")
                    .and_then(|m| m.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let refs: Vec<&str> = modifiers.iter().map(|s| s.as_str()).collect();
                t.keyboard_key(&key, &refs).await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "scroll",
        ToolEntry::new(
            "Scroll at screen coordinates.",
            obj_schema(
                json!({
                    "x": {"type": "integer"}, "y": {"type": "integer"},
                    "deltaX": {"type": "integer"}, "deltaY": {"type": "integer"}
                }),
                &["x", "y", "deltaX", "deltaY"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.scroll(
                    i64_arg(&args, "x")? as i32,
                    i64_arg(&args, "y")? as i32,
                    i64_arg(&args, "deltaX")? as i32,
                    i64_arg(&args, "deltaY")? as i32,
                )
                .await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "readFile",
        ToolEntry::new(
            "Read a text file inside the guest.",
            obj_schema(json!({"path": {"type": "string"}}), &["path"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let content = t.read_file(&str_arg(&args, "path")?).await?;
                Ok(json!({"content": content}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "writeFile",
        ToolEntry::new(
            "Write a text file inside the guest.",
            obj_schema(
                json!({"path": {"type": "string"}, "content": {"type": "string"}}),
                &["path", "content"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.write_file(&str_arg(&args, "path")?, &str_arg(&args, "content")?)
                    .await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "listDirectory",
        ToolEntry::new(
            "List a directory inside the guest.",
            obj_schema(json!({"path": {"type": "string"}}), &["path"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let entries = t.list_directory(&str_arg(&args, "path")?).await?;
                let listed: Vec<Value> = entries
                    .iter()
                    .map(|e| json!({"name": e.name, "isDir": e.is_dir, "size": e.size}))
                    .collect();
                Ok(json!({"entries": listed}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "moveFile",
        ToolEntry::new(
            "Move or rename a file inside the guest.",
            obj_schema(
                json!({"source": {"type": "string"}, "destination": {"type": "string"}}),
                &["source", "destination"],
            ),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.move_file(&str_arg(&args, "source")?, &str_arg(&args, "destination")?)
                    .await?;
                Ok(json!({"ok": true}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "runShell",
        ToolEntry::new(
            "Run a shell command inside the guest and return its output.",
            obj_schema(
                json!({
                    "command": {"type": "string"},
                    "timeoutSecs": {"type": "integer"}
                }),
                &["command"],
            ),
        )
        .gated(),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let command = str_arg(&args, "command")?;
                let timeout = args
                    .get("timeoutSecs")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(60) as u32;
                let out = t.run_shell(&command, timeout).await?;
                Ok(json!({
                    "stdout": out.stdout,
                    "stderr": out.stderr,
                    "exitCode": out.exit_code,
                }))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "clipboardRead",
        ToolEntry::new("Read the guest clipboard.", obj_schema(json!({}), &[])),
        Arc::new(move |_| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                let text = t.clipboard_read().await?;
                Ok(json!({"text": text}))
            })
        }),
    );

    let t = Arc::clone(&transport);
    registry.register(
        "clipboardWrite",
        ToolEntry::new(
            "Write text to the guest clipboard.",
            obj_schema(json!({"text": {"type": "string"}}), &["text"]),
        ),
        Arc::new(move |args| {
            let t = Arc::clone(&t);
            Box::pin(async move {
                t.clipboard_write(&str_arg(&args, "text")?).await?;
                Ok(json!({"ok": true}))
            })
        }),
    );
}
