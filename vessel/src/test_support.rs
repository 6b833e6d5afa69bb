//! In-memory hypervisor and agent doubles for unit tests.
//!
//! The loopback backend fakes the vsock transport with unix socketpairs,
//! and the mock agent records every RPC into a shared event log so tests
//! can assert call ordering without a real guest.

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use oci_spec::runtime::Spec;
use tokio_stream::wrappers::UnboundedReceiverStream;
use vessel_shared::{VesselError, VesselResult};

use crate::agent::{
    ContainerStatistics, DnsConfiguration, HostsConfiguration, ProcessOptions, SocketRelayAgent,
    StdioPorts, VirtualMachineAgent,
};
use crate::mounts::{AttachedFilesystem, ComposedMounts};
use crate::relay::UnixSocketConfiguration;
use crate::vm::backend::{ConnectionStream, HypervisorBackend, HypervisorState};
use crate::vm::{
    AgentFactory, VirtualMachineInstance, VirtualMachineManager, VmConfiguration, VmInstance,
    VsockConnection,
};

pub type EventLog = Arc<parking_lot::Mutex<Vec<String>>>;

pub fn new_event_log() -> EventLog {
    Arc::new(parking_lot::Mutex::new(Vec::new()))
}

pub fn record(log: &EventLog, event: impl Into<String>) {
    log.lock().push(event.into());
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().clone()
}

/// Index of the first event starting with `prefix`, panicking when absent.
pub fn event_index(log: &EventLog, prefix: &str) -> usize {
    let snapshot = events(log);
    snapshot
        .iter()
        .position(|e| e.starts_with(prefix))
        .unwrap_or_else(|| panic!("event {prefix:?} not found in {snapshot:?}"))
}

fn new_pair() -> VesselResult<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .map_err(|err| VesselError::internal_with("socketpair failed", err))
}

/// Fake hypervisor: vsock ports are unix socketpairs.
pub struct LoopbackBackend {
    events: EventLog,
    state: parking_lot::RwLock<HypervisorState>,
    listeners: parking_lot::Mutex<HashMap<u32, tokio::sync::mpsc::UnboundedSender<VsockConnection>>>,
    /// Guest-side peers of host dials, by port.
    dialed: parking_lot::Mutex<HashMap<u32, VecDeque<OwnedFd>>>,
}

impl LoopbackBackend {
    pub fn new(events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            events,
            state: parking_lot::RwLock::new(HypervisorState::Stopped),
            listeners: parking_lot::Mutex::new(HashMap::new()),
            dialed: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Guest side dialing back into a host listener.
    pub fn guest_connect(&self, port: u32) -> VesselResult<OwnedFd> {
        let sender = self
            .listeners
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| VesselError::NotFound(format!("no host listener on port {port}")))?;
        let (host_end, guest_end) = new_pair()?;
        sender
            .send(VsockConnection::detached(host_end))
            .map_err(|_| VesselError::internal("host listener gone"))?;
        Ok(guest_end)
    }

    /// Guest-side peer of the most recent host dial on `port`.
    pub fn take_dialed(&self, port: u32) -> Option<OwnedFd> {
        self.dialed.lock().get_mut(&port)?.pop_front()
    }
}

#[async_trait]
impl HypervisorBackend for LoopbackBackend {
    fn state(&self) -> HypervisorState {
        *self.state.read()
    }

    async fn start(&self) -> VesselResult<()> {
        record(&self.events, "vm_start");
        *self.state.write() = HypervisorState::Running;
        Ok(())
    }

    async fn stop(&self) -> VesselResult<()> {
        record(&self.events, "vm_stop");
        *self.state.write() = HypervisorState::Stopped;
        Ok(())
    }

    async fn pause(&self) -> VesselResult<()> {
        record(&self.events, "vm_pause");
        *self.state.write() = HypervisorState::Paused;
        Ok(())
    }

    async fn resume(&self) -> VesselResult<()> {
        record(&self.events, "vm_resume");
        *self.state.write() = HypervisorState::Running;
        Ok(())
    }

    async fn connect(&self, port: u32) -> VesselResult<VsockConnection> {
        let (host_end, guest_end) = new_pair()?;
        self.dialed
            .lock()
            .entry(port)
            .or_default()
            .push_back(guest_end);
        Ok(VsockConnection::detached(host_end))
    }

    async fn listen(&self, port: u32) -> VesselResult<ConnectionStream> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.listeners.lock().insert(port, tx);
        Ok(UnboundedReceiverStream::new(rx)
            .map(Ok::<_, VesselError>)
            .boxed())
    }

    async fn close_listener(&self, port: u32) -> VesselResult<()> {
        self.listeners.lock().remove(&port);
        Ok(())
    }
}

/// Guest-side descriptors of a mock-created process's stdio.
#[derive(Default)]
pub struct GuestStdio {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Recording agent double. One instance is shared across every dialed
/// channel, so the event log sees the union of all calls in order.
pub struct MockAgent {
    pub events: EventLog,
    backend: parking_lot::Mutex<Option<Arc<LoopbackBackend>>>,
    pub relay_capable: bool,
    pub exit_code: AtomicI32,
    pub delete_count: AtomicUsize,
    next_pid: AtomicI32,
    guest_stdio: parking_lot::Mutex<HashMap<String, GuestStdio>>,
}

impl MockAgent {
    pub fn new(events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            events,
            backend: parking_lot::Mutex::new(None),
            relay_capable: true,
            exit_code: AtomicI32::new(0),
            delete_count: AtomicUsize::new(0),
            next_pid: AtomicI32::new(100),
            guest_stdio: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn without_relay_support(events: EventLog) -> Arc<Self> {
        Arc::new(Self {
            events,
            backend: parking_lot::Mutex::new(None),
            relay_capable: false,
            exit_code: AtomicI32::new(0),
            delete_count: AtomicUsize::new(0),
            next_pid: AtomicI32::new(100),
            guest_stdio: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn set_backend(&self, backend: Arc<LoopbackBackend>) {
        *self.backend.lock() = Some(backend);
    }

    pub fn take_guest_stdio(&self, process_id: &str) -> Option<GuestStdio> {
        self.guest_stdio.lock().remove(process_id)
    }

    fn backend(&self) -> VesselResult<Arc<LoopbackBackend>> {
        self.backend
            .lock()
            .clone()
            .ok_or_else(|| VesselError::internal("mock agent has no backend"))
    }
}

#[async_trait]
impl VirtualMachineAgent for Arc<MockAgent> {
    async fn standard_setup(&self) -> VesselResult<()> {
        record(&self.events, "standard_setup");
        Ok(())
    }

    async fn mount(&self, fs: &AttachedFilesystem) -> VesselResult<()> {
        record(
            &self.events,
            format!(
                "mount:{}:{}:{}:[{}]",
                fs.fs_type,
                fs.source,
                fs.destination,
                fs.options.join(",")
            ),
        );
        Ok(())
    }

    async fn umount(&self, path: &str, flags: i32) -> VesselResult<()> {
        record(&self.events, format!("umount:{path}:{flags}"));
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool, mode: u32) -> VesselResult<()> {
        record(&self.events, format!("mkdir:{path}:{recursive}:{mode:o}"));
        Ok(())
    }

    async fn address_add(&self, name: &str, address: &str) -> VesselResult<()> {
        record(&self.events, format!("address_add:{name}:{address}"));
        Ok(())
    }

    async fn up(&self, name: &str, mtu: u32) -> VesselResult<()> {
        record(&self.events, format!("up:{name}:{mtu}"));
        Ok(())
    }

    async fn route_add_default(&self, name: &str, gateway: &str) -> VesselResult<()> {
        record(&self.events, format!("route_add_default:{name}:{gateway}"));
        Ok(())
    }

    async fn configure_dns(
        &self,
        _config: &DnsConfiguration,
        rootfs_location: &str,
    ) -> VesselResult<()> {
        record(&self.events, format!("configure_dns:{rootfs_location}"));
        Ok(())
    }

    async fn configure_hosts(
        &self,
        _config: &HostsConfiguration,
        rootfs_location: &str,
    ) -> VesselResult<()> {
        record(&self.events, format!("configure_hosts:{rootfs_location}"));
        Ok(())
    }

    async fn create_process(
        &self,
        id: &str,
        _container_id: Option<&str>,
        stdio: &StdioPorts,
        spec: &Spec,
        _options: &ProcessOptions,
    ) -> VesselResult<()> {
        let readonly = spec
            .root()
            .as_ref()
            .and_then(|root| root.readonly())
            .unwrap_or(false);
        let pid_ns = spec
            .linux()
            .as_ref()
            .and_then(|linux| linux.namespaces().as_ref())
            .and_then(|namespaces| {
                namespaces
                    .iter()
                    .find(|ns| ns.typ() == oci_spec::runtime::LinuxNamespaceType::Pid)
            })
            .and_then(|ns| ns.path().clone())
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        record(
            &self.events,
            format!("create_process:{id}:ro={readonly}:pidns={pid_ns}"),
        );

        // Dial back on every configured stdio port, like the real guest.
        let backend = self.backend()?;
        let mut guest = GuestStdio::default();
        if let Some(port) = stdio.stdin {
            guest.stdin = Some(backend.guest_connect(port)?);
        }
        if let Some(port) = stdio.stdout {
            guest.stdout = Some(backend.guest_connect(port)?);
        }
        if let Some(port) = stdio.stderr {
            guest.stderr = Some(backend.guest_connect(port)?);
        }
        self.guest_stdio.lock().insert(id.to_string(), guest);
        Ok(())
    }

    async fn start_process(&self, id: &str, _container_id: Option<&str>) -> VesselResult<i32> {
        record(&self.events, format!("start_process:{id}"));
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    async fn signal_process(
        &self,
        id: &str,
        _container_id: Option<&str>,
        signal: i32,
    ) -> VesselResult<()> {
        record(&self.events, format!("signal_process:{id}:{signal}"));
        Ok(())
    }

    async fn wait_process(
        &self,
        id: &str,
        _container_id: Option<&str>,
        _timeout: Option<Duration>,
    ) -> VesselResult<i32> {
        record(&self.events, format!("wait_process:{id}"));
        Ok(self.exit_code.load(Ordering::Relaxed))
    }

    async fn resize_process(
        &self,
        id: &str,
        _container_id: Option<&str>,
        rows: u16,
        cols: u16,
    ) -> VesselResult<()> {
        record(&self.events, format!("resize_process:{id}:{rows}x{cols}"));
        Ok(())
    }

    async fn close_process_stdin(&self, id: &str, _container_id: Option<&str>) -> VesselResult<()> {
        record(&self.events, format!("close_process_stdin:{id}"));
        Ok(())
    }

    async fn delete_process(&self, id: &str, _container_id: Option<&str>) -> VesselResult<()> {
        record(&self.events, format!("delete_process:{id}"));
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn container_statistics(
        &self,
        container_ids: &[String],
    ) -> VesselResult<Vec<ContainerStatistics>> {
        record(&self.events, "container_statistics");
        Ok(container_ids
            .iter()
            .map(|id| ContainerStatistics {
                container_id: id.clone(),
                process_count: 1,
                cpu_usage_usec: 1000,
                memory_usage_bytes: 4096,
                memory_limit_bytes: None,
            })
            .collect())
    }

    async fn kill(&self, pid: i32, signal: i32) -> VesselResult<()> {
        record(&self.events, format!("kill:{pid}:{signal}"));
        Ok(())
    }

    async fn set_time(&self, _seconds: i64, _nanoseconds: u32) -> VesselResult<()> {
        record(&self.events, "set_time");
        Ok(())
    }

    async fn enable_rosetta(&self) -> VesselResult<()> {
        record(&self.events, "enable_rosetta");
        Ok(())
    }

    async fn close(&self) -> VesselResult<()> {
        record(&self.events, "agent_close");
        Ok(())
    }

    fn socket_relay(&self) -> Option<&dyn SocketRelayAgent> {
        if self.relay_capable {
            Some(self.as_ref() as &dyn SocketRelayAgent)
        } else {
            None
        }
    }
}

#[async_trait]
impl SocketRelayAgent for MockAgent {
    async fn relay_socket(&self, port: u32, config: &UnixSocketConfiguration) -> VesselResult<()> {
        record(&self.events, format!("relay_socket:{}:{port}", config.id));
        Ok(())
    }

    async fn stop_socket_relay(&self, config: &UnixSocketConfiguration) -> VesselResult<()> {
        record(&self.events, format!("stop_socket_relay:{}", config.id));
        Ok(())
    }
}

/// Factory handing out channels onto the shared mock agent.
pub struct MockAgentFactory {
    pub agent: Arc<MockAgent>,
}

#[async_trait]
impl AgentFactory for MockAgentFactory {
    async fn connect(
        &self,
        _connection: VsockConnection,
    ) -> VesselResult<Box<dyn VirtualMachineAgent>> {
        Ok(Box::new(Arc::clone(&self.agent)))
    }
}

/// Build a VM instance over a fresh loopback backend and the given agent.
pub fn loopback_vm(
    events: &EventLog,
    agent: &Arc<MockAgent>,
) -> (Arc<dyn VirtualMachineInstance>, Arc<LoopbackBackend>) {
    let backend = LoopbackBackend::new(Arc::clone(events));
    agent.set_backend(Arc::clone(&backend));
    let factory = Arc::new(MockAgentFactory {
        agent: Arc::clone(agent),
    });
    let vm: Arc<dyn VirtualMachineInstance> =
        Arc::new(VmInstance::new(backend.clone(), factory, false));
    (vm, backend)
}

/// VM manager creating loopback-backed instances.
pub struct MockVmm {
    pub events: EventLog,
    pub agent: Arc<MockAgent>,
    pub last_backend: parking_lot::Mutex<Option<Arc<LoopbackBackend>>>,
}

impl MockVmm {
    pub fn new(events: EventLog, agent: Arc<MockAgent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            agent,
            last_backend: parking_lot::Mutex::new(None),
        })
    }
}

#[async_trait]
impl VirtualMachineManager for MockVmm {
    async fn create_instance(
        &self,
        config: &VmConfiguration,
        _mounts: &ComposedMounts,
    ) -> VesselResult<Arc<dyn VirtualMachineInstance>> {
        record(&self.events, "vm_create");
        let backend = LoopbackBackend::new(Arc::clone(&self.events));
        self.agent.set_backend(Arc::clone(&backend));
        *self.last_backend.lock() = Some(Arc::clone(&backend));

        let factory = Arc::new(MockAgentFactory {
            agent: Arc::clone(&self.agent),
        });
        Ok(Arc::new(VmInstance::new(backend, factory, config.rosetta)))
    }
}
