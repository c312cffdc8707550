//! VM error taxonomy
//!
//! Every variant is fatal to the operation that raised it but never to the
//! host process. Helper-connectivity failures are a separate variant so that
//! idempotent reads can treat them as transient and retry.

/// Error type for VM lifecycle operations
#[derive(Debug)]
pub enum VmError {
    /// No VM with the given id is known to the manager
    NotFound(String),
    /// Operation requires a stopped VM but it is booting/ready/busy
    AlreadyRunning(String),
    /// Operation requires a running VM but it is stopped
    NotRunning(String),
    /// The VM booted but the guest never became healthy in time,
    /// or the helper rejected the boot request
    InstallationFailed(String),
    /// Cloning or resetting the disk image failed
    DiskCreationFailed(String),
    /// The bundle config is missing or malformed
    ConfigInvalid(String),
    /// Host capacity exhausted (pool at maximum size)
    InsufficientResources(String),
    /// The privileged helper process is unreachable or returned an error
    Helper(String),
    /// Catch-all for internal invariant violations
    Internal(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::NotFound(id) => write!(f, "VM not found: {}", id),
            VmError::AlreadyRunning(id) => write!(f, "VM already running: {}", id),
            VmError::NotRunning(id) => write!(f, "VM not running: {}", id),
            VmError::InstallationFailed(msg) => write!(f, "VM installation failed: {}", msg),
            VmError::DiskCreationFailed(msg) => write!(f, "Disk creation failed: {}", msg),
            VmError::ConfigInvalid(msg) => write!(f, "Invalid VM config: {}", msg),
            VmError::InsufficientResources(msg) => {
                write!(f, "Insufficient resources: {}", msg)
            }
            VmError::Helper(msg) => write!(f, "VM helper error: {}", msg),
            VmError::Internal(msg) => write!(f, "Internal VM error: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}

impl From<std::io::Error> for VmError {
    fn from(e: std::io::Error) -> Self {
        VmError::Internal(e.to_string())
    }
}
