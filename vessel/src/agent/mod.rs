//! Client-side contract of the in-guest supervisor.
//!
//! The guest agent is reached over vsock and mediates mount, network, and
//! process RPCs. The wire protocol lives outside this crate; everything
//! here programs against the trait. Handles are vended per use by
//! [`crate::vm::VirtualMachineInstance::dial_agent`] and released with
//! [`VirtualMachineAgent::close`] on every exit path.

mod types;

use async_trait::async_trait;
use oci_spec::runtime::Spec;
use std::time::Duration;
use vessel_shared::VesselResult;

use crate::mounts::AttachedFilesystem;
use crate::relay::UnixSocketConfiguration;

pub use types::{
    ContainerStatistics, DnsConfiguration, HostsConfiguration, HostsEntry, ProcessOptions,
    StdioPorts,
};

/// Signal all processes in the workload's cgroup.
pub const KILL_ALL: i32 = -1;

/// Optional capability: the agent can relay unix sockets through vsock.
#[async_trait]
pub trait SocketRelayAgent: Send + Sync {
    /// Ask the guest to wire `config` through vsock port `port`.
    async fn relay_socket(&self, port: u32, config: &UnixSocketConfiguration) -> VesselResult<()>;

    /// Tear down the guest side of a relay.
    async fn stop_socket_relay(&self, config: &UnixSocketConfiguration) -> VesselResult<()>;
}

/// RPC surface of the guest agent, client side.
///
/// Every method suspends on the underlying channel. Implementations are
/// handles onto one vsock connection; dropping a handle without calling
/// [`close`](Self::close) leaks the guest-side connection until the VM
/// stops.
#[async_trait]
pub trait VirtualMachineAgent: Send + Sync {
    /// Idempotent guest initialization.
    async fn standard_setup(&self) -> VesselResult<()>;

    async fn mount(&self, fs: &AttachedFilesystem) -> VesselResult<()>;

    async fn umount(&self, path: &str, flags: i32) -> VesselResult<()>;

    async fn mkdir(&self, path: &str, recursive: bool, mode: u32) -> VesselResult<()>;

    /// Assign an IPv4 address (CIDR) to a guest interface.
    async fn address_add(&self, name: &str, address: &str) -> VesselResult<()>;

    /// Bring a guest interface up.
    async fn up(&self, name: &str, mtu: u32) -> VesselResult<()>;

    async fn route_add_default(&self, name: &str, gateway: &str) -> VesselResult<()>;

    /// Write `/etc/resolv.conf` under `rootfs_location`.
    async fn configure_dns(
        &self,
        config: &DnsConfiguration,
        rootfs_location: &str,
    ) -> VesselResult<()>;

    /// Write `/etc/hosts` under `rootfs_location`.
    async fn configure_hosts(
        &self,
        config: &HostsConfiguration,
        rootfs_location: &str,
    ) -> VesselResult<()>;

    /// Create a process; the guest dials back on the stdio ports to wire
    /// standard streams before this returns.
    async fn create_process(
        &self,
        id: &str,
        container_id: Option<&str>,
        stdio: &StdioPorts,
        spec: &Spec,
        options: &ProcessOptions,
    ) -> VesselResult<()>;

    /// Start a created process, returning its guest pid.
    async fn start_process(&self, id: &str, container_id: Option<&str>) -> VesselResult<i32>;

    async fn signal_process(
        &self,
        id: &str,
        container_id: Option<&str>,
        signal: i32,
    ) -> VesselResult<()>;

    /// Wait for a process to exit, returning its exit code.
    async fn wait_process(
        &self,
        id: &str,
        container_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> VesselResult<i32>;

    async fn resize_process(
        &self,
        id: &str,
        container_id: Option<&str>,
        rows: u16,
        cols: u16,
    ) -> VesselResult<()>;

    async fn close_process_stdin(&self, id: &str, container_id: Option<&str>) -> VesselResult<()>;

    async fn delete_process(&self, id: &str, container_id: Option<&str>) -> VesselResult<()>;

    async fn container_statistics(
        &self,
        container_ids: &[String],
    ) -> VesselResult<Vec<ContainerStatistics>>;

    /// Signal a guest pid; `pid == KILL_ALL` signals every process in the
    /// cgroup.
    async fn kill(&self, pid: i32, signal: i32) -> VesselResult<()>;

    /// Re-align the guest clock.
    async fn set_time(&self, seconds: i64, nanoseconds: u32) -> VesselResult<()>;

    /// Set up the optional x86_64 translator inside the guest.
    async fn enable_rosetta(&self) -> VesselResult<()>;

    /// Release the underlying channel.
    async fn close(&self) -> VesselResult<()>;

    /// Probe for the socket-relay capability.
    fn socket_relay(&self) -> Option<&dyn SocketRelayAgent> {
        None
    }
}
