//! vessel - container lifecycle orchestration on lightweight VMs.
//!
//! Runs a Linux container (or a pod of containers) inside its own virtual
//! machine: composes guest filesystems out of mount requests, drives the
//! VM from cold boot to a running init process and back down, pumps stdio
//! between host and guest over vsock, and relays unix sockets across the
//! same transport.
//!
//! ## Architecture
//!
//! ```text
//! LinuxContainer / LinuxPod      public lifecycle API (one lock each)
//!    ├─ MountComposer            requests -> block devices + share tags
//!    ├─ VmInstance               state machine over a HypervisorBackend
//!    │    └─ agent channel      dialed per use, released on every path
//!    ├─ LinuxProcess             stdio over vsock ports, wait/kill/delete
//!    └─ RelayManager             unix socket <-> vsock byte pumps
//! ```

pub mod agent;
pub mod container;
pub mod mounts;
pub mod net;
pub mod process;
pub mod relay;
pub mod util;
pub mod vm;

#[cfg(test)]
pub(crate) mod test_support;

pub use vessel_shared::{VesselError, VesselResult, VsockAddress};

/// Install the default tracing subscriber, honoring `RUST_LOG`.
///
/// Library consumers usually install their own; this is for binaries and
/// tests. Calling it twice is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
