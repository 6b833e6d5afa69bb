//! Vsock addressing value types.

use serde::{Deserialize, Serialize};

/// Well-known vsock port the in-guest supervisor listens on.
pub const AGENT_PORT: u32 = 1024;

/// Wildcard context id accepted by host-side vsock listeners.
pub const CONTEXT_ID_ANY: u32 = u32::MAX;

/// A vsock endpoint: (context id, port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VsockAddress {
    pub context_id: u32,
    pub port: u32,
}

impl VsockAddress {
    pub fn new(context_id: u32, port: u32) -> Self {
        Self { context_id, port }
    }
}

impl std::fmt::Display for VsockAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vsock://{}:{}", self.context_id, self.port)
    }
}
