//! VM Lifecycle Manager
//!
//! Owns the authoritative map from VM id to lifecycle state and mediates
//! every process-level operation through the privileged helper. Per-VM state
//! machine:
//!
//! ```text
//! stopped -> booting -> ready -> busy -> ready -> suspending -> stopped
//! ```
//!
//! `error` is reachable from any transition on failure. `busy` means a guest
//! agent transport is bound to the VM; at most one may be bound at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Instant, SystemTime};

use tokio::time::Duration;
use uuid::Uuid;

use crate::guest::{GuestTransport, TransportConfig};
use crate::metrics::VM_BOOT_DURATION;

use super::config::{ResourceConfig, VmBundle};
use super::error::VmError;
use super::helper::VmController;

/// Lifecycle status of one VM
#[derive(Debug, Clone, PartialEq)]
pub enum VmStatus {
    Stopped,
    Booting,
    Ready,
    Busy,
    Suspending,
    Error(String),
}

/// Configuration for the VM manager
#[derive(Debug, Clone)]
pub struct VmManagerConfig {
    /// Directory holding golden-image template bundles, one per template id
    pub templates_dir: PathBuf,
    /// Directory where cloned VM bundles are created, one per VM id
    pub vms_dir: PathBuf,
    /// Interval between guest readiness probes after boot
    pub probe_interval: Duration,
    /// Window within which the guest must answer a health check
    pub boot_timeout: Duration,
    /// Grace period for guest-initiated shutdown before the helper kills
    pub shutdown_grace: Duration,
    /// Transport settings used for readiness probes and graceful shutdown
    pub probe_transport: TransportConfig,
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            templates_dir: PathBuf::from("./templates"),
            vms_dir: PathBuf::from("./vms"),
            probe_interval: Duration::from_secs(2),
            boot_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
            probe_transport: TransportConfig {
                connect_retries: 1,
                connect_retry_delay: Duration::from_millis(100),
                request_timeout: Duration::from_secs(5),
            },
        }
    }
}

struct VmRecord {
    bundle: VmBundle,
    resources: ResourceConfig,
    status: VmStatus,
    developer_mode: bool,
    created_at: SystemTime,
    last_used: SystemTime,
}

/// Point-in-time view of one VM, safe to hand out
#[derive(Debug, Clone)]
pub struct VmSnapshot {
    pub id: String,
    pub status: VmStatus,
    pub bundle_path: PathBuf,
    pub resources: ResourceConfig,
    pub developer_mode: bool,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
}

/// Manages creation, boot, shutdown and deletion of VMs
pub struct VmManager {
    controller: Arc<dyn VmController>,
    vms: StdMutex<HashMap<String, VmRecord>>,
    config: VmManagerConfig,
}

impl VmManager {
    pub fn new(controller: Arc<dyn VmController>, config: VmManagerConfig) -> Self {
        Self {
            controller,
            vms: StdMutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &VmManagerConfig {
        &self.config
    }

    /// Clone a golden-image bundle into a fresh VM. Does not boot it.
    pub fn create_vm_from_template(
        &self,
        template_id: &str,
        name: &str,
        developer_mode: bool,
    ) -> Result<String, VmError> {
        let vm_id = format!("vm-{}", Uuid::now_v7());
        let template = VmBundle::at(self.config.templates_dir.join(template_id));
        let bundle = VmBundle::clone_from(&template, self.config.vms_dir.join(&vm_id), name)?;
        let resources = bundle.load_config()?.resources;

        let now = SystemTime::now();
        self.vms.lock().unwrap().insert(
            vm_id.clone(),
            VmRecord {
                bundle,
                resources,
                status: VmStatus::Stopped,
                developer_mode,
                created_at: now,
                last_used: now,
            },
        );

        tracing::info!(vm_id = %vm_id, template = template_id, "created VM from template");
        Ok(vm_id)
    }

    /// Boot a stopped VM and wait for the guest agent to become healthy.
    pub async fn start_vm(&self, id: &str) -> Result<(), VmError> {
        let start_time = Instant::now();

        // Transition stopped -> booting under the lock; a double start
        // observes booting/ready/busy and is rejected with state unchanged.
        let (bundle, resources) = {
            let mut vms = self.vms.lock().unwrap();
            let record = vms.get_mut(id).ok_or_else(|| VmError::NotFound(id.into()))?;
            if record.status != VmStatus::Stopped {
                return Err(VmError::AlreadyRunning(id.into()));
            }
            record.status = VmStatus::Booting;
            (record.bundle.clone(), record.resources.clone())
        };

        tracing::info!(vm_id = id, "booting VM");
        if let Err(e) = self
            .controller
            .boot(id, bundle.root(), &resources)
            .await
        {
            self.set_status(id, VmStatus::Error(e.to_string()));
            return Err(e);
        }

        // Poll guest readiness: the VM counts as ready only once the agent
        // inside it answers a health check.
        let deadline = Instant::now() + self.config.boot_timeout;
        loop {
            match GuestTransport::connect(
                &bundle.agent_socket(),
                self.config.probe_transport.clone(),
            )
            .await
            {
                Ok(probe) => {
                    if probe.health_check().await.is_ok() {
                        probe.close();
                        break;
                    }
                    probe.close();
                }
                Err(e) => {
                    tracing::debug!(vm_id = id, error = %e, "guest not reachable yet");
                }
            }

            if Instant::now() >= deadline {
                let msg = format!(
                    "guest did not become healthy within {:?}",
                    self.config.boot_timeout
                );
                tracing::warn!(vm_id = id, "boot timed out, killing VM");
                let _ = self.controller.kill(id).await;
                self.set_status(id, VmStatus::Error(msg.clone()));
                return Err(VmError::InstallationFailed(msg));
            }

            tokio::time::sleep(self.config.probe_interval).await;
        }

        self.touch(id, VmStatus::Ready);
        let boot_duration = start_time.elapsed();
        VM_BOOT_DURATION.observe(boot_duration.as_secs_f64());
        tracing::info!(vm_id = id, boot_secs = boot_duration.as_secs_f64(), "VM ready");
        Ok(())
    }

    /// Stop a running VM.
    ///
    /// The graceful path asks the guest to shut itself down and waits a
    /// bounded grace period before the helper kills the process; the forced
    /// path kills immediately. Ends in `stopped` or `error`.
    pub async fn stop_vm(&self, id: &str, force: bool) -> Result<(), VmError> {
        let bundle = {
            let mut vms = self.vms.lock().unwrap();
            let record = vms.get_mut(id).ok_or_else(|| VmError::NotFound(id.into()))?;
            match record.status {
                VmStatus::Stopped => return Err(VmError::NotRunning(id.into())),
                _ => record.status = VmStatus::Suspending,
            }
            record.bundle.clone()
        };

        if !force {
            // Best effort: a wedged guest falls through to the kill below.
            let graceful = tokio::time::timeout(self.config.shutdown_grace, async {
                let probe = GuestTransport::connect(
                    &bundle.agent_socket(),
                    self.config.probe_transport.clone(),
                )
                .await?;
                let result = probe.shutdown().await;
                probe.close();
                result
            })
            .await;
            match graceful {
                Ok(Ok(())) => tracing::debug!(vm_id = id, "guest accepted shutdown"),
                Ok(Err(e)) => tracing::warn!(vm_id = id, error = %e, "graceful shutdown failed"),
                Err(_) => tracing::warn!(vm_id = id, "graceful shutdown timed out"),
            }
        }

        if let Err(e) = self.controller.kill(id).await {
            self.set_status(id, VmStatus::Error(e.to_string()));
            return Err(e);
        }

        self.set_status(id, VmStatus::Stopped);
        tracing::info!(vm_id = id, force, "VM stopped");
        Ok(())
    }

    /// Delete a stopped VM's bundle. Idempotent when already absent.
    pub fn delete_vm(&self, id: &str) -> Result<(), VmError> {
        let mut vms = self.vms.lock().unwrap();
        if let Some(record) = vms.get(id) {
            match record.status {
                VmStatus::Stopped | VmStatus::Error(_) => {}
                _ => return Err(VmError::AlreadyRunning(id.into())),
            }
            record.bundle.delete()?;
            vms.remove(id);
        } else {
            // Unknown id: remove any leftover bundle directory, succeed
            // either way so a repeated delete is a no-op.
            VmBundle::at(self.config.vms_dir.join(id)).delete()?;
        }
        tracing::info!(vm_id = id, "VM deleted");
        Ok(())
    }

    /// Fractional install/boot progress; -1.0 when the VM is not installing.
    pub async fn get_install_progress(&self, id: &str) -> Result<f64, VmError> {
        let installing = {
            let vms = self.vms.lock().unwrap();
            let record = vms.get(id).ok_or_else(|| VmError::NotFound(id.into()))?;
            record.status == VmStatus::Booting
        };
        if !installing {
            return Ok(-1.0);
        }
        self.controller.install_progress(id).await
    }

    pub fn list_vms(&self) -> Vec<VmSnapshot> {
        let vms = self.vms.lock().unwrap();
        vms.iter()
            .map(|(id, r)| VmSnapshot {
                id: id.clone(),
                status: r.status.clone(),
                bundle_path: r.bundle.root().to_path_buf(),
                resources: r.resources.clone(),
                developer_mode: r.developer_mode,
                created_at: r.created_at,
                last_used: r.last_used,
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> Result<VmStatus, VmError> {
        let vms = self.vms.lock().unwrap();
        vms.get(id)
            .map(|r| r.status.clone())
            .ok_or_else(|| VmError::NotFound(id.into()))
    }

    /// Path of the guest agent socket for a VM.
    pub fn agent_socket(&self, id: &str) -> Result<PathBuf, VmError> {
        let vms = self.vms.lock().unwrap();
        vms.get(id)
            .map(|r| r.bundle.agent_socket())
            .ok_or_else(|| VmError::NotFound(id.into()))
    }

    /// Mark a VM busy while a transport is bound to it.
    ///
    /// Enforces the one-transport-per-VM invariant: binding requires `ready`.
    pub fn bind_transport(&self, id: &str) -> Result<(), VmError> {
        let mut vms = self.vms.lock().unwrap();
        let record = vms.get_mut(id).ok_or_else(|| VmError::NotFound(id.into()))?;
        match record.status {
            VmStatus::Ready => {
                record.status = VmStatus::Busy;
                record.last_used = SystemTime::now();
                Ok(())
            }
            VmStatus::Busy => Err(VmError::AlreadyRunning(format!(
                "{} already has a bound transport",
                id
            ))),
            _ => Err(VmError::NotRunning(id.into())),
        }
    }

    /// Return a VM from busy to ready once its transport is gone.
    pub fn release_transport(&self, id: &str) {
        let mut vms = self.vms.lock().unwrap();
        if let Some(record) = vms.get_mut(id) {
            if record.status == VmStatus::Busy {
                record.status = VmStatus::Ready;
                record.last_used = SystemTime::now();
            }
        }
    }

    fn set_status(&self, id: &str, status: VmStatus) {
        let mut vms = self.vms.lock().unwrap();
        if let Some(record) = vms.get_mut(id) {
            record.status = status;
        }
    }

    fn touch(&self, id: &str, status: VmStatus) {
        let mut vms = self.vms.lock().unwrap();
        if let Some(record) = vms.get_mut(id) {
            record.status = status;
            record.last_used = SystemTime::now();
        }
    }

    #[cfg(test)]
    pub(crate) fn force_status_for_test(&self, id: &str, status: VmStatus) {
        self.set_status(id, status);
    }
}
