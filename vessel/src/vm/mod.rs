//! Virtual machine instances.
//!
//! Adapter between the hypervisor and the rest of the system: owns the VM
//! lifecycle, vends vsock connections and listeners, and runs the guest
//! clock syncer. The hypervisor itself sits behind
//! [`backend::HypervisorBackend`].

pub mod backend;
mod config;
mod instance;
mod timesync;
mod vsock;

pub use config::{
    BootLog, HypervisorLaunchConfig, Kernel, LaunchBlockDevice, LaunchDirectoryShare,
    VmConfiguration,
};
pub use instance::{
    AgentFactory, VirtualMachineInstance, VirtualMachineManager, VmInstance, VmState,
};
pub use vsock::{VsockAcceptStream, VsockConnection, VsockListenerCloser};
