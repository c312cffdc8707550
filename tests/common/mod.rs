//! Shared fixtures: an in-process fake guest served over a duplex pipe,
//! scripted LLM providers, and a stub VM source.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use agentvisor::guest::{GuestTransport, TransportConfig};
use agentvisor::llm::{
    ChatError, ChatMessage, ChatResponse, FunctionCall, LlmProvider, Tool, ToolCall, Usage,
};
use agentvisor::tools::{register_guest_tools, ToolRegistry};
use agentvisor::vm::{VmError, VmLease, VmSource, VmTarget};

/// Spawn a guest agent double answering JSON-RPC over a duplex pipe.
///
/// Every served method is recorded. Methods listed in `fail_methods` get a
/// JSON-RPC error response (a tool-level failure, not a disconnect).
pub fn spawn_guest(fail_methods: &[&str]) -> (Arc<GuestTransport>, Arc<StdMutex<Vec<String>>>) {
    let fail: Vec<String> = fail_methods.iter().map(|s| s.to_string()).collect();
    let served: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let log = Arc::clone(&served);

    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let req: Value = serde_json::from_str(&line).unwrap();
            let method = req["method"].as_str().unwrap().to_string();
            log.lock().unwrap().push(method.clone());

            let reply = if fail.contains(&method) {
                json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "error": {"code": -32000, "message": format!("{} refused", method)},
                })
            } else {
                let result = match method.as_str() {
                    "screenshot" => json!({
                        "format": "png", "data": "", "width": 1280, "height": 800
                    }),
                    "healthCheck" => json!({"status": "ok", "uptimeSecs": 1}),
                    "runShell" => json!({"stdout": "ok\n", "stderr": "", "exitCode": 0}),
                    _ => json!({"ok": true}),
                };
                json!({"jsonrpc": "2.0", "id": req["id"], "result": result})
            };
            let _ = write.write_all(reply.to_string().as_bytes()).await;
            let _ = write.write_all(b"\n").await;
        }
    });

    let transport = Arc::new(GuestTransport::from_stream(client, TransportConfig::default()));
    (transport, served)
}

/// Registry with the guest tool set plus the interaction tool schemas.
pub fn guest_registry(transport: Arc<GuestTransport>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_guest_tools(&mut registry, transport);
    registry.register_interaction_tools();
    registry
}

pub fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        message: ChatMessage::assistant(content),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

pub fn tool_response(calls: &[(&str, Value)]) -> ChatResponse {
    let tool_calls: Vec<ToolCall> = calls
        .iter()
        .enumerate()
        .map(|(i, (name, args))| ToolCall {
            id: format!("call_{}", i),
            function: FunctionCall {
                name: name.to_string(),
                arguments: args.clone(),
            },
        })
        .collect();
    ChatResponse {
        message: ChatMessage::assistant_with_calls("", tool_calls),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// Provider returning a fixed script of responses, then "done" forever.
pub struct ScriptedProvider {
    responses: StdMutex<VecDeque<ChatResponse>>,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: StdMutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, _: &[ChatMessage], _: &[Tool]) -> Result<ChatResponse, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| text_response("done")))
    }
}

/// Provider whose calls never resolve; used to test cancel-in-flight.
pub struct HangingProvider;

#[async_trait]
impl LlmProvider for HangingProvider {
    fn model(&self) -> &str {
        "hanging"
    }

    async fn chat(&self, _: &[ChatMessage], _: &[Tool]) -> Result<ChatResponse, ChatError> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

/// Provider that blocks each call on a semaphore permit and tracks the
/// maximum number of in-flight calls. Responses follow the script, then
/// "done" forever.
pub struct GatedProvider {
    gate: Arc<tokio::sync::Semaphore>,
    responses: StdMutex<VecDeque<ChatResponse>>,
    in_flight: AtomicUsize,
    pub calls: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl GatedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = Arc::new(Self {
            gate: Arc::clone(&gate),
            responses: StdMutex::new(responses.into()),
            in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        (provider, gate)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for GatedProvider {
    fn model(&self) -> &str {
        "gated"
    }

    async fn chat(&self, _: &[ChatMessage], _: &[Tool]) -> Result<ChatResponse, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Consume the permit so each add_permits releases exactly one call.
        self.gate.acquire().await.unwrap().forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| text_response("done")))
    }
}

/// VM source handing out fake-guest leases; counts acquires and releases.
pub struct StubVmSource {
    next_id: AtomicUsize,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl StubVmSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }
}

/// VM source whose acquires park on a semaphore permit; `waiting` counts
/// callers currently parked. Lets a test act while a copy is still waiting
/// for its VM.
pub struct GatedVmSource {
    pub inner: Arc<StubVmSource>,
    gate: Arc<tokio::sync::Semaphore>,
    pub waiting: AtomicUsize,
}

impl GatedVmSource {
    pub fn new() -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let source = Arc::new(Self {
            inner: StubVmSource::new(),
            gate: Arc::clone(&gate),
            waiting: AtomicUsize::new(0),
        });
        (source, gate)
    }
}

#[async_trait]
impl VmSource for GatedVmSource {
    async fn acquire(&self, target: VmTarget) -> Result<VmLease, VmError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        // Consume the permit so each add_permits releases exactly one acquire.
        self.gate.acquire().await.unwrap().forget();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.acquire(target).await
    }

    async fn release(&self, lease: VmLease) {
        self.inner.release(lease).await
    }
}

#[async_trait]
impl VmSource for StubVmSource {
    async fn acquire(&self, _target: VmTarget) -> Result<VmLease, VmError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (transport, _) = spawn_guest(&[]);
        Ok(VmLease {
            vm_id: format!("vm-{}", n),
            transport,
            developer_mode: false,
        })
    }

    async fn release(&self, lease: VmLease) {
        lease.transport.close();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
