//! VM lifecycle: bundles, the privileged helper boundary, the per-VM state
//! machine, and the bounded pool.

pub mod config;
pub mod error;
pub mod helper;
pub mod manager;
pub mod pool;

pub use config::{BundleConfig, ResourceConfig, VmBundle};
pub use error::VmError;
pub use helper::{HelperClient, HelperVmState, VmController};
pub use manager::{VmManager, VmManagerConfig, VmSnapshot, VmStatus};
pub use pool::{VmLease, VmPool, VmSource, VmTarget};
