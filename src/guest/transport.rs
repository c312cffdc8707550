//! Guest agent transport - request/response channel into the VM
//!
//! One transport is bound to one VM at a time. Outgoing calls are assigned
//! monotonically increasing ids; a background reader task decodes response
//! lines and completes the matching pending call. Unmatched messages
//! (notifications) are logged and discarded without blocking pending calls.
//!
//! Error discipline: a timed-out call is retryable by the caller; a
//! disconnect is not - the connection must be re-established first. A
//! JSON-RPC `error` object from the guest is a tool-level failure and is
//! reported as `TransportError::Rpc`, distinct from both.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use super::protocol::{decode_response, encode_request, RpcError};

/// Type-erased write half so the transport works over Unix sockets in
/// production and `tokio::io::duplex` pipes in tests.
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connection lifecycle of the transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Error type for guest transport operations
#[derive(Debug, Clone)]
pub enum TransportError {
    /// No connection has been established (or it was closed)
    NotConnected,
    /// All connect attempts failed
    ConnectionFailed(String),
    /// The call got no response within the timeout window; retryable
    Timeout { method: String },
    /// The underlying stream died; reconnect before retrying
    Disconnected,
    /// The guest could not perform the action (tool-level failure)
    Rpc { code: i64, message: String },
    /// Malformed payload in an otherwise healthy exchange
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "transport not connected"),
            TransportError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            TransportError::Timeout { method } => {
                write!(f, "request timed out: {}", method)
            }
            TransportError::Disconnected => write!(f, "transport disconnected"),
            TransportError::Rpc { code, message } => {
                write!(f, "guest error {}: {}", code, message)
            }
            TransportError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// True when the session cannot continue over this connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected
                | TransportError::ConnectionFailed(_)
                | TransportError::Disconnected
        )
    }
}

/// Retry/backoff and timeout knobs; constants observed in production,
/// kept configurable rather than hardcoded.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum socket connect attempts before surfacing `ConnectionFailed`
    pub connect_retries: u32,
    /// Delay between connect attempts
    pub connect_retry_delay: Duration,
    /// Per-call response wait
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_retries: 20,
            connect_retry_delay: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
        }
    }
}

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value, RpcError>>>>>;

/// JSON-RPC channel to the agent process inside one guest VM
pub struct GuestTransport {
    writer: Mutex<BoxedWriter>,
    pending: PendingMap,
    state: Arc<StdMutex<ConnectionState>>,
    next_id: AtomicU64,
    config: TransportConfig,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl GuestTransport {
    /// Connect to the guest agent socket with bounded retry.
    ///
    /// The guest agent comes up some time after the VM boots, so the first
    /// attempts are expected to fail with connection-refused.
    pub async fn connect(path: &Path, config: TransportConfig) -> Result<Self, TransportError> {
        let mut last_error = None;

        for attempt in 0..config.connect_retries {
            match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => {
                    tracing::debug!(path = %path.display(), attempt, "guest transport connected");
                    return Ok(Self::from_stream(stream, config));
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < config.connect_retries {
                        tokio::time::sleep(config.connect_retry_delay).await;
                    }
                }
            }
        }

        Err(TransportError::ConnectionFailed(format!(
            "{} after {} attempts: {}",
            path.display(),
            config.connect_retries,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".into())
        )))
    }

    /// Wrap an already-established byte stream (used directly by tests).
    pub fn from_stream<S>(stream: S, config: TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(write_half);

        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let state = Arc::new(StdMutex::new(ConnectionState::Connected));

        let reader_pending = Arc::clone(&pending);
        let reader_state = Arc::clone(&state);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_response(&line) {
                            Ok(resp) => {
                                let Some(id) = resp.id else {
                                    tracing::debug!("discarding guest notification");
                                    continue;
                                };
                                let sender = reader_pending.lock().unwrap().remove(&id);
                                match sender {
                                    Some(tx) => {
                                        let outcome = match resp.error {
                                            Some(err) => Err(err),
                                            None => Ok(resp
                                                .result
                                                .unwrap_or(serde_json::Value::Null)),
                                        };
                                        let _ = tx.send(outcome);
                                    }
                                    None => {
                                        tracing::debug!(id, "response for unknown call id");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "undecodable guest message");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "guest transport read error");
                        break;
                    }
                }
            }
            // Stream is gone. Dropping the pending senders wakes every
            // in-flight call with a disconnect.
            *reader_state.lock().unwrap() = ConnectionState::Disconnected;
            reader_pending.lock().unwrap().clear();
        });

        Self {
            writer: Mutex::new(writer),
            pending,
            state,
            next_id: AtomicU64::new(1),
            config,
            reader_task: StdMutex::new(Some(reader_task)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    /// Issue one JSON-RPC call and await its correlated response.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let line = encode_request(id, method, params);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                *self.state.lock().unwrap() = ConnectionState::Disconnected;
                tracing::warn!(method, error = %e, "guest transport write failed");
                return Err(TransportError::Disconnected);
            }
            if let Err(e) = writer.flush().await {
                self.pending.lock().unwrap().remove(&id);
                *self.state.lock().unwrap() = ConnectionState::Disconnected;
                tracing::warn!(method, error = %e, "guest transport flush failed");
                return Err(TransportError::Disconnected);
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            // No response in time: retryable, distinct from disconnect
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                })
            }
            // Sender dropped: reader task died, connection is gone
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc))) => Err(TransportError::Rpc {
                code: rpc.code,
                message: rpc.message,
            }),
        }
    }

    /// Drop the connection and stop the reader task.
    pub fn close(&self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for GuestTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
