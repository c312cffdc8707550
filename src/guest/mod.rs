//! Guest agent transport
//!
//! JSON-RPC channel to the agent process running inside a guest VM:
//! envelope/codec (`protocol`), the correlated request/response transport
//! (`transport`), and typed wrappers for the guest method set (`methods`).

pub mod methods;
pub mod protocol;
pub mod transport;

pub use methods::{DirEntry, HealthReport, MouseButton, Screenshot, ShellOutput};
pub use protocol::RpcError;
pub use transport::{ConnectionState, GuestTransport, TransportConfig, TransportError};
