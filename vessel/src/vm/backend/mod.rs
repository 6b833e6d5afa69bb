//! Hypervisor backends.
//!
//! A backend owns the actual virtual machine: lifecycle operations plus the
//! vsock transport. Everything above it (instance state machine, agent
//! dialing, listeners) is backend-agnostic.

mod child;

use async_trait::async_trait;
use futures::stream::BoxStream;
use vessel_shared::VesselResult;

use super::vsock::VsockConnection;

pub use child::ChildHypervisor;

/// Raw hypervisor state, mapped onto [`super::VmState`] by the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
    /// Anything the hypervisor reports that we do not model.
    Unknown,
}

/// Stream of connections accepted on one vsock port.
pub type ConnectionStream = BoxStream<'static, VesselResult<VsockConnection>>;

/// Operations a hypervisor must provide.
#[async_trait]
pub trait HypervisorBackend: Send + Sync {
    fn state(&self) -> HypervisorState;

    /// Prestart hook, run before [`start`](Self::start). Backends install
    /// translation data or other boot-time assets here.
    async fn prepare(&self) -> VesselResult<()> {
        Ok(())
    }

    async fn start(&self) -> VesselResult<()>;

    async fn stop(&self) -> VesselResult<()>;

    async fn pause(&self) -> VesselResult<()>;

    async fn resume(&self) -> VesselResult<()>;

    /// Dial a guest vsock port.
    async fn connect(&self, port: u32) -> VesselResult<VsockConnection>;

    /// Open a host-side listener on a vsock port.
    async fn listen(&self, port: u32) -> VesselResult<ConnectionStream>;

    /// Tear down the listener on `port`. Idempotent.
    async fn close_listener(&self, port: u32) -> VesselResult<()>;
}
