//! Container and pod configuration.

use std::collections::HashMap;
use std::sync::Arc;

use oci_spec::runtime::PosixRlimitType;

use crate::agent::{DnsConfiguration, HostsConfiguration};
use crate::mounts::MountRequest;
use crate::net::Interface;
use crate::relay::UnixSocketConfiguration;
use crate::vm::{BootLog, Kernel};

/// Credentials the process runs with.
#[derive(Debug, Clone, Default)]
pub struct UserSpec {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

/// One resource limit applied to the process.
#[derive(Debug, Clone)]
pub struct Rlimit {
    pub limit_type: PosixRlimitType,
    pub hard: u64,
    pub soft: u64,
}

/// The in-guest process a container runs.
#[derive(Debug, Clone)]
pub struct ProcessConfiguration {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub user: UserSpec,
    pub rlimits: Vec<Rlimit>,
    pub terminal: bool,
}

impl Default for ProcessConfiguration {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: Vec::new(),
            cwd: "/".to_string(),
            user: UserSpec::default(),
            rlimits: Vec::new(),
            terminal: false,
        }
    }
}

impl ProcessConfiguration {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }
}

/// Full configuration of a single container and the VM carrying it.
/// Immutable once the container is created.
#[derive(Clone)]
pub struct ContainerConfiguration {
    pub id: String,
    pub rootfs: MountRequest,
    pub mounts: Vec<MountRequest>,
    pub process: ProcessConfiguration,
    pub hostname: Option<String>,
    pub sysctl: HashMap<String, String>,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub interfaces: Vec<Arc<dyn Interface>>,
    pub dns: Option<DnsConfiguration>,
    pub hosts: Option<HostsConfiguration>,
    pub sockets: Vec<UnixSocketConfiguration>,
    pub kernel: Kernel,
    pub boot_log: Option<BootLog>,
    pub nested_virtualization: bool,
    pub rosetta: bool,
}

impl ContainerConfiguration {
    pub fn new(id: impl Into<String>, rootfs: MountRequest, kernel: Kernel) -> Self {
        Self {
            id: id.into(),
            rootfs,
            mounts: Vec::new(),
            process: ProcessConfiguration::default(),
            hostname: None,
            sysctl: HashMap::new(),
            cpus: 1,
            memory_bytes: 256 << 20,
            interfaces: Vec::new(),
            dns: None,
            hosts: None,
            sockets: Vec::new(),
            kernel,
            boot_log: None,
            nested_virtualization: false,
            rosetta: false,
        }
    }

    pub fn with_process(mut self, process: ProcessConfiguration) -> Self {
        self.process = process;
        self
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_memory_bytes(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn with_mount(mut self, mount: MountRequest) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_interface(mut self, interface: Arc<dyn Interface>) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_dns(mut self, dns: DnsConfiguration) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_hosts(mut self, hosts: HostsConfiguration) -> Self {
        self.hosts = Some(hosts);
        self
    }

    pub fn with_socket(mut self, socket: UnixSocketConfiguration) -> Self {
        self.sockets.push(socket);
        self
    }

    pub fn with_sysctl(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.sysctl.insert(key.into(), value.into());
        self
    }
}

/// One member of a pod.
#[derive(Debug, Clone)]
pub struct PodContainerConfig {
    pub id: String,
    pub rootfs: MountRequest,
    pub mounts: Vec<MountRequest>,
    pub process: ProcessConfiguration,
    pub hostname: Option<String>,
    pub sysctl: HashMap<String, String>,
    pub cpus: u32,
    pub memory_bytes: u64,
}

impl PodContainerConfig {
    pub fn new(id: impl Into<String>, rootfs: MountRequest) -> Self {
        Self {
            id: id.into(),
            rootfs,
            mounts: Vec::new(),
            process: ProcessConfiguration::default(),
            hostname: None,
            sysctl: HashMap::new(),
            cpus: 1,
            memory_bytes: 256 << 20,
        }
    }

    pub fn with_process(mut self, process: ProcessConfiguration) -> Self {
        self.process = process;
        self
    }

    pub fn with_mount(mut self, mount: MountRequest) -> Self {
        self.mounts.push(mount);
        self
    }
}

/// Configuration of a pod: one VM, several containers.
#[derive(Clone)]
pub struct PodConfiguration {
    pub id: String,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub interfaces: Vec<Arc<dyn Interface>>,
    pub dns: Option<DnsConfiguration>,
    pub hosts: Option<HostsConfiguration>,
    pub sockets: Vec<UnixSocketConfiguration>,
    pub kernel: Kernel,
    pub boot_log: Option<BootLog>,
    pub nested_virtualization: bool,
    pub rosetta: bool,
    /// Run every container in the pause container's PID namespace.
    pub share_process_namespace: bool,
}

impl PodConfiguration {
    pub fn new(id: impl Into<String>, kernel: Kernel) -> Self {
        Self {
            id: id.into(),
            cpus: 1,
            memory_bytes: 512 << 20,
            interfaces: Vec::new(),
            dns: None,
            hosts: None,
            sockets: Vec::new(),
            kernel,
            boot_log: None,
            nested_virtualization: false,
            rosetta: false,
            share_process_namespace: false,
        }
    }

    pub fn with_shared_process_namespace(mut self, shared: bool) -> Self {
        self.share_process_namespace = shared;
        self
    }

    pub fn with_socket(mut self, socket: UnixSocketConfiguration) -> Self {
        self.sockets.push(socket);
        self
    }
}
