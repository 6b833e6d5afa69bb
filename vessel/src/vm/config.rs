//! VM configuration and kernel command line.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vessel_shared::{VesselError, VesselResult};

use crate::mounts::{ComposedMounts, MountRequest, WorkloadMounts};
use crate::net::{Interface, NetworkDeviceConfig};

/// Where serial console output goes.
#[derive(Clone)]
pub enum BootLog {
    /// Append to (or truncate) a file on the host.
    File { path: PathBuf, truncate: bool },
    /// Write to a caller-supplied descriptor.
    Fd(Arc<OwnedFd>),
}

impl std::fmt::Debug for BootLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { path, truncate } => f
                .debug_struct("BootLog::File")
                .field("path", path)
                .field("truncate", truncate)
                .finish(),
            Self::Fd(_) => f.write_str("BootLog::Fd"),
        }
    }
}

/// Guest kernel and the arguments handed to the init process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub path: PathBuf,
    /// Extra arguments for the init process, appended after a literal `--`.
    pub init_args: Vec<String>,
}

impl Kernel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            init_args: Vec::new(),
        }
    }

    pub fn with_init_args(mut self, args: Vec<String>) -> Self {
        self.init_args = args;
        self
    }

    /// Render the kernel command line for the given initial filesystem.
    pub fn command_line(&self, initial_fs: &MountRequest) -> VesselResult<String> {
        let root = if initial_fs.is_share() {
            "rootfstype=virtiofs root=rootfs"
        } else if initial_fs.is_block() {
            "rootfstype=ext4 root=/dev/vda"
        } else {
            return Err(VesselError::InvalidArgument(format!(
                "initial filesystem must be a block device or a directory share, got {}",
                initial_fs.fs_type
            )));
        };

        let mut cmdline = format!("{root} init=/sbin/vminitd ro");
        if !self.init_args.is_empty() {
            cmdline.push_str(" -- ");
            cmdline.push_str(&self.init_args.join(" "));
        }
        Ok(cmdline)
    }
}

/// Full configuration of one VM.
#[derive(Clone)]
pub struct VmConfiguration {
    /// Virtual CPU count, at least 1.
    pub cpus: u32,
    pub memory_bytes: u64,
    /// Attached interfaces, named `eth{N}` by position.
    pub interfaces: Vec<Arc<dyn Interface>>,
    /// Mount requests grouped by workload id, in workload order. The first
    /// workload's rootfs is the initial filesystem.
    pub workloads: Vec<WorkloadMounts>,
    pub boot_log: Option<BootLog>,
    pub nested_virtualization: bool,
    pub kernel: Kernel,
    /// Enable the x86_64 translator after boot.
    pub rosetta: bool,
}

impl VmConfiguration {
    pub fn validate(&self) -> VesselResult<()> {
        if self.cpus < 1 {
            return Err(VesselError::InvalidArgument(
                "a VM needs at least one cpu".to_string(),
            ));
        }
        if self.memory_bytes == 0 {
            return Err(VesselError::InvalidArgument(
                "a VM needs a memory budget".to_string(),
            ));
        }
        if self.workloads.is_empty() {
            return Err(VesselError::InvalidArgument(
                "a VM needs at least one workload".to_string(),
            ));
        }
        Ok(())
    }

    pub fn initial_filesystem(&self) -> VesselResult<&MountRequest> {
        self.workloads
            .first()
            .map(|w| &w.rootfs)
            .ok_or_else(|| VesselError::InvalidState("no workloads configured".to_string()))
    }
}

impl std::fmt::Debug for VmConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmConfiguration")
            .field("cpus", &self.cpus)
            .field("memory_bytes", &self.memory_bytes)
            .field("interfaces", &self.interfaces.len())
            .field("workloads", &self.workloads.len())
            .field("nested_virtualization", &self.nested_virtualization)
            .field("kernel", &self.kernel)
            .finish()
    }
}

/// Serialized block device entry for a hypervisor child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchBlockDevice {
    pub host_path: PathBuf,
    pub device_path: String,
    pub read_only: bool,
}

/// Serialized directory share entry for a hypervisor child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchDirectoryShare {
    pub host_path: PathBuf,
    pub tag: String,
    pub read_only: bool,
}

/// The flattened configuration a hypervisor child process boots from,
/// passed as one JSON argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorLaunchConfig {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub kernel_path: PathBuf,
    pub command_line: String,
    pub block_devices: Vec<LaunchBlockDevice>,
    pub directory_shares: Vec<LaunchDirectoryShare>,
    pub network_devices: Vec<NetworkDeviceConfig>,
    pub nested_virtualization: bool,
}

impl HypervisorLaunchConfig {
    /// Flatten a validated configuration and its composed mounts. Block
    /// devices keep allocation order; shares keep attachment order.
    pub fn build(config: &VmConfiguration, mounts: &ComposedMounts) -> VesselResult<Self> {
        config.validate()?;
        let command_line = config.kernel.command_line(&mounts.initial_filesystem)?;

        Ok(Self {
            cpus: config.cpus,
            memory_bytes: config.memory_bytes,
            kernel_path: config.kernel.path.clone(),
            command_line,
            block_devices: mounts
                .block_devices
                .iter()
                .map(|dev| LaunchBlockDevice {
                    host_path: dev.host_path.clone(),
                    device_path: dev.device_path.clone(),
                    read_only: dev.read_only,
                })
                .collect(),
            directory_shares: mounts
                .directory_shares
                .iter()
                .map(|share| LaunchDirectoryShare {
                    host_path: share.host_path.clone(),
                    tag: share.tag.clone(),
                    read_only: share.read_only,
                })
                .collect(),
            network_devices: config
                .interfaces
                .iter()
                .enumerate()
                .map(|(index, iface)| NetworkDeviceConfig::from_interface(index, iface))
                .collect(),
            nested_virtualization: config.nested_virtualization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::{MountComposer, MountRequest};

    fn kernel() -> Kernel {
        Kernel::new("/var/lib/vessel/vmlinux")
    }

    #[test]
    fn test_command_line_for_block_root() {
        let rootfs = MountRequest::block("ext4", "/images/rfs.ext4", "/", vec![]);
        let cmdline = kernel().command_line(&rootfs).unwrap();
        assert!(cmdline.contains("rootfstype=ext4 root=/dev/vda"));
        assert!(cmdline.contains("init=/sbin/vminitd ro"));
        assert!(!cmdline.contains("--"));
    }

    #[test]
    fn test_command_line_for_shared_root() {
        let rootfs = MountRequest::share("/shares/root", "/", vec![]);
        let cmdline = kernel().command_line(&rootfs).unwrap();
        assert!(cmdline.contains("rootfstype=virtiofs root=rootfs"));
        assert!(cmdline.contains("init=/sbin/vminitd ro"));
    }

    #[test]
    fn test_init_args_follow_separator() {
        let rootfs = MountRequest::block("ext4", "/images/rfs.ext4", "/", vec![]);
        let cmdline = kernel()
            .with_init_args(vec!["--debug".to_string(), "--port=7".to_string()])
            .command_line(&rootfs)
            .unwrap();
        assert!(cmdline.ends_with("-- --debug --port=7"));
    }

    #[test]
    fn test_generic_initial_filesystem_rejected() {
        let rootfs = MountRequest::generic("tmpfs", "tmpfs", "/", vec![]);
        let err = kernel().command_line(&rootfs).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_launch_config_carries_devices() {
        let composed = MountComposer::new()
            .compose(vec![crate::mounts::WorkloadMounts {
                id: "c1".to_string(),
                rootfs: MountRequest::block("ext4", "/images/rfs.ext4", "/", vec![]),
                mounts: vec![],
            }])
            .unwrap();

        let config = VmConfiguration {
            cpus: 2,
            memory_bytes: 512 << 20,
            interfaces: vec![],
            workloads: composed
                .containers
                .iter()
                .map(|c| crate::mounts::WorkloadMounts {
                    id: c.id.clone(),
                    rootfs: MountRequest::block("ext4", "/images/rfs.ext4", "/", vec![]),
                    mounts: vec![],
                })
                .collect(),
            boot_log: None,
            nested_virtualization: false,
            kernel: kernel(),
            rosetta: false,
        };

        let launch = HypervisorLaunchConfig::build(&config, &composed).unwrap();
        assert_eq!(launch.block_devices.len(), 1);
        assert_eq!(launch.block_devices[0].device_path, "/dev/vda");
        assert!(launch.command_line.contains("root=/dev/vda"));
    }

    #[test]
    fn test_zero_cpu_rejected() {
        let config = VmConfiguration {
            cpus: 0,
            memory_bytes: 1 << 30,
            interfaces: vec![],
            workloads: vec![crate::mounts::WorkloadMounts {
                id: "c1".to_string(),
                rootfs: MountRequest::block("ext4", "/x.ext4", "/", vec![]),
                mounts: vec![],
            }],
            boot_log: None,
            nested_virtualization: false,
            kernel: kernel(),
            rosetta: false,
        };
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_argument");
    }
}
