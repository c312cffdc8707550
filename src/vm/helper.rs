//! Privileged VM helper client
//!
//! Virtualization requires entitlements the orchestrating process should not
//! hold, so actual VM processes are owned by a separate privileged helper.
//! The helper exposes a small HTTP API over a Unix domain socket; this module
//! provides the client for it behind the `VmController` trait so the manager
//! (and tests) never depend on the concrete IPC mechanism.
//!
//! The helper may restart at any time. Connection-level failures on
//! idempotent reads (`list`) are treated as transient and retried.

use std::path::Path;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use super::config::ResourceConfig;
use super::error::VmError;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Helper-side view of one VM process
#[derive(Debug, Clone, Deserialize)]
pub struct HelperVmState {
    pub vm_id: String,
    pub running: bool,
    pub pid: Option<u32>,
}

/// Boot request payload sent to the helper
#[derive(Debug, Serialize)]
struct BootRequest<'a> {
    bundle_path: &'a str,
    cpu_count: u32,
    memory_mb: u64,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    progress: f64,
}

/// Internal split between "could not reach the helper" and "the helper said no"
enum HelperFailure {
    Unreachable(String),
    Rejected(hyper::StatusCode, String),
}

impl HelperFailure {
    fn into_vm_error(self, endpoint: &str) -> VmError {
        match self {
            HelperFailure::Unreachable(msg) => {
                VmError::Helper(format!("helper unreachable: {}", msg))
            }
            HelperFailure::Rejected(status, msg) => VmError::Helper(format!(
                "helper returned {} on {}: {}",
                status, endpoint, msg
            )),
        }
    }
}

/// Boundary to the privileged helper process owning the VM processes
#[async_trait]
pub trait VmController: Send + Sync {
    /// Boot a VM from its bundle. Returns once the VM process is up;
    /// guest readiness is probed separately by the manager.
    async fn boot(
        &self,
        vm_id: &str,
        bundle_path: &Path,
        resources: &ResourceConfig,
    ) -> Result<(), VmError>;

    /// Terminate the VM process immediately.
    async fn kill(&self, vm_id: &str) -> Result<(), VmError>;

    /// List VM processes the helper currently owns.
    async fn list(&self) -> Result<Vec<HelperVmState>, VmError>;

    /// Fractional install/boot progress, 0.0-1.0, or -1.0 when not installing.
    async fn install_progress(&self, vm_id: &str) -> Result<f64, VmError>;
}

/// HTTP-over-UDS client for the privileged helper
pub struct HelperClient {
    client: HyperClient,
    socket_path: String,
    /// Attempts for idempotent reads when the helper is restarting
    read_retries: u32,
    read_retry_delay: Duration,
}

impl HelperClient {
    /// Create a new helper client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the helper's Unix control socket
    pub fn new(socket_path: impl Into<String>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
            read_retries: 3,
            read_retry_delay: Duration::from_millis(500),
        }
    }

    /// Send a request and return the response body on 2xx.
    async fn send_request(
        &self,
        method: hyper::Method,
        endpoint: &str,
        body: Option<String>,
    ) -> Result<Bytes, HelperFailure> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HelperFailure::Unreachable(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| HelperFailure::Unreachable(e.to_string()))?;

        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| HelperFailure::Unreachable(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let msg = String::from_utf8_lossy(&bytes).to_string();
            return Err(HelperFailure::Rejected(status, msg));
        }

        Ok(bytes)
    }
}

#[async_trait]
impl VmController for HelperClient {
    async fn boot(
        &self,
        vm_id: &str,
        bundle_path: &Path,
        resources: &ResourceConfig,
    ) -> Result<(), VmError> {
        let body = serde_json::to_string(&BootRequest {
            bundle_path: &bundle_path.to_string_lossy(),
            cpu_count: resources.cpu_count,
            memory_mb: resources.memory_mb,
        })
        .map_err(|e| VmError::Internal(e.to_string()))?;

        let endpoint = format!("/vms/{}/boot", vm_id);
        match self
            .send_request(hyper::Method::PUT, &endpoint, Some(body))
            .await
        {
            Ok(_) => Ok(()),
            // A refused boot is an installation failure, not plumbing
            Err(HelperFailure::Rejected(status, msg)) => Err(VmError::InstallationFailed(
                format!("helper rejected boot ({}): {}", status, msg),
            )),
            Err(e) => Err(e.into_vm_error(&endpoint)),
        }
    }

    async fn kill(&self, vm_id: &str) -> Result<(), VmError> {
        let endpoint = format!("/vms/{}/kill", vm_id);
        self.send_request(hyper::Method::PUT, &endpoint, None)
            .await
            .map(|_| ())
            .map_err(|e| e.into_vm_error(&endpoint))
    }

    async fn list(&self) -> Result<Vec<HelperVmState>, VmError> {
        let mut last_err = None;
        for attempt in 0..self.read_retries {
            match self.send_request(hyper::Method::GET, "/vms", None).await {
                Ok(bytes) => {
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| VmError::Helper(format!("bad list payload: {}", e)));
                }
                Err(e) => {
                    let err = e.into_vm_error("/vms");
                    tracing::warn!(attempt, error = %err, "helper list failed, retrying");
                    last_err = Some(err);
                    if attempt + 1 < self.read_retries {
                        tokio::time::sleep(self.read_retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| VmError::Helper("helper unreachable".into())))
    }

    async fn install_progress(&self, vm_id: &str) -> Result<f64, VmError> {
        let endpoint = format!("/vms/{}/install-progress", vm_id);
        let bytes = self
            .send_request(hyper::Method::GET, &endpoint, None)
            .await
            .map_err(|e| e.into_vm_error(&endpoint))?;
        let parsed: ProgressResponse = serde_json::from_slice(&bytes)
            .map_err(|e| VmError::Helper(format!("bad progress payload: {}", e)))?;
        Ok(parsed.progress)
    }
}
