//! Bounded VM pool
//!
//! Hands out exclusive leases on ready VMs. `acquire` reuses an idle ready VM
//! when one exists, otherwise clones a fresh VM from the golden template and
//! boots it, bounded by `max_vms`. A lease carries the bound guest transport;
//! the VM stays `busy` until the lease is released.
//!
//! Cleanup on release: an ephemeral VM is stopped and its bundle wiped; a
//! developer-mode VM is stopped but retained for reuse and debugging.

use std::sync::Arc;

use async_trait::async_trait;

use crate::guest::GuestTransport;
use crate::metrics::{POOL_BUSY_VMS, POOL_READY_VMS};

use super::error::VmError;
use super::manager::{VmManager, VmStatus};

/// Which VM a session should run in
#[derive(Debug, Clone)]
pub enum VmTarget {
    /// Any ephemeral VM, cloned from the pool's template when none is idle
    Ephemeral,
    /// A specific existing VM, kept across sessions (developer mode)
    Named(String),
}

/// Exclusive lease on one ready VM with its bound transport
pub struct VmLease {
    pub vm_id: String,
    pub transport: Arc<GuestTransport>,
    pub developer_mode: bool,
}

impl std::fmt::Debug for VmLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLease")
            .field("vm_id", &self.vm_id)
            .field("developer_mode", &self.developer_mode)
            .finish_non_exhaustive()
    }
}

/// Source of VM leases; the orchestrator depends on this, not on `VmPool`,
/// so tests can substitute an in-memory source.
#[async_trait]
pub trait VmSource: Send + Sync {
    async fn acquire(&self, target: VmTarget) -> Result<VmLease, VmError>;
    async fn release(&self, lease: VmLease);
}

/// Template-backed pool over a `VmManager`
pub struct VmPool {
    manager: Arc<VmManager>,
    template_id: String,
    max_vms: usize,
}

impl VmPool {
    pub fn new(manager: Arc<VmManager>, template_id: impl Into<String>, max_vms: usize) -> Self {
        Self {
            manager,
            template_id: template_id.into(),
            max_vms,
        }
    }

    fn update_gauges(&self) {
        let vms = self.manager.list_vms();
        let ready = vms.iter().filter(|v| v.status == VmStatus::Ready).count();
        let busy = vms.iter().filter(|v| v.status == VmStatus::Busy).count();
        POOL_READY_VMS.set(ready as f64);
        POOL_BUSY_VMS.set(busy as f64);
    }

    /// Number of VMs currently counting against the pool bound.
    fn active_count(&self) -> usize {
        self.manager
            .list_vms()
            .iter()
            .filter(|v| {
                matches!(
                    v.status,
                    VmStatus::Booting | VmStatus::Ready | VmStatus::Busy | VmStatus::Suspending
                )
            })
            .count()
    }

    /// Bind a transport to a ready VM and wrap it in a lease.
    async fn lease(&self, vm_id: String, developer_mode: bool) -> Result<VmLease, VmError> {
        self.manager.bind_transport(&vm_id)?;
        let socket = match self.manager.agent_socket(&vm_id) {
            Ok(path) => path,
            Err(e) => {
                self.manager.release_transport(&vm_id);
                return Err(e);
            }
        };
        match GuestTransport::connect(&socket, self.manager.config().probe_transport.clone()).await
        {
            Ok(transport) => {
                self.update_gauges();
                Ok(VmLease {
                    vm_id,
                    transport: Arc::new(transport),
                    developer_mode,
                })
            }
            Err(e) => {
                self.manager.release_transport(&vm_id);
                Err(VmError::Internal(format!(
                    "could not bind transport to {}: {}",
                    vm_id, e
                )))
            }
        }
    }

    async fn acquire_ephemeral(&self) -> Result<VmLease, VmError> {
        // Reuse an idle ready ephemeral VM when one exists.
        let idle = self
            .manager
            .list_vms()
            .into_iter()
            .find(|v| v.status == VmStatus::Ready && !v.developer_mode);
        if let Some(vm) = idle {
            tracing::debug!(vm_id = %vm.id, "reusing idle VM from pool");
            return self.lease(vm.id, false).await;
        }

        if self.active_count() >= self.max_vms {
            return Err(VmError::InsufficientResources(format!(
                "pool limit of {} VMs reached",
                self.max_vms
            )));
        }

        let vm_id =
            self.manager
                .create_vm_from_template(&self.template_id, "pool VM", false)?;
        if let Err(e) = self.manager.start_vm(&vm_id).await {
            // Boot failed: the clone is useless, wipe it.
            let _ = self.manager.delete_vm(&vm_id);
            return Err(e);
        }
        self.lease(vm_id, false).await
    }

    async fn acquire_named(&self, vm_id: &str) -> Result<VmLease, VmError> {
        let status = self.manager.status(vm_id)?;
        match status {
            VmStatus::Ready => {}
            VmStatus::Stopped => self.manager.start_vm(vm_id).await?,
            VmStatus::Busy => {
                return Err(VmError::AlreadyRunning(format!(
                    "{} is already leased",
                    vm_id
                )))
            }
            other => {
                return Err(VmError::NotRunning(format!(
                    "{} is {:?}, not leasable",
                    vm_id, other
                )))
            }
        }
        let developer_mode = self
            .manager
            .list_vms()
            .iter()
            .find(|v| v.id == vm_id)
            .map(|v| v.developer_mode)
            .unwrap_or(false);
        self.lease(vm_id.to_string(), developer_mode).await
    }
}

#[async_trait]
impl VmSource for VmPool {
    async fn acquire(&self, target: VmTarget) -> Result<VmLease, VmError> {
        let result = match &target {
            VmTarget::Ephemeral => self.acquire_ephemeral().await,
            VmTarget::Named(id) => self.acquire_named(id).await,
        };
        self.update_gauges();
        result
    }

    async fn release(&self, lease: VmLease) {
        let VmLease {
            vm_id,
            transport,
            developer_mode,
        } = lease;

        transport.close();
        self.manager.release_transport(&vm_id);

        // Ephemeral VMs are wiped; developer-mode VMs are stopped and kept.
        if let Err(e) = self.manager.stop_vm(&vm_id, false).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "stop on release failed");
        }
        if !developer_mode {
            if let Err(e) = self.manager.delete_vm(&vm_id) {
                tracing::warn!(vm_id = %vm_id, error = %e, "wipe on release failed");
            }
        }
        self.update_gauges();
    }
}
