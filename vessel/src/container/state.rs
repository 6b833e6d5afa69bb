//! Controller phases.

use std::collections::HashMap;
use std::sync::Arc;

use vessel_shared::VesselError;

use super::config::PodContainerConfig;
use crate::mounts::ComposedMounts;
use crate::process::LinuxProcess;
use crate::relay::RelayManager;
use crate::vm::VirtualMachineInstance;

/// Public snapshot of a controller's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Initialized,
    Created,
    Started,
    Paused,
    Stopped,
    Errored,
}

/// Live resources of a created (or started) container.
pub(crate) struct ContainerRuntime {
    pub vm: Arc<dyn VirtualMachineInstance>,
    pub relays: Arc<RelayManager>,
    /// Keeps file-mount staging directories alive for the VM lifetime.
    pub _mounts: ComposedMounts,
    pub process: Option<Arc<LinuxProcess>>,
}

/// Phase of a single-container controller. An error during any transition
/// parks the controller in `Errored`; subsequent calls fail fast with the
/// stored error.
pub(crate) enum ContainerPhase {
    Initialized,
    Created(ContainerRuntime),
    Started(ContainerRuntime),
    Paused(ContainerRuntime),
    Stopped,
    Errored(VesselError),
}

impl ContainerPhase {
    pub fn status(&self) -> ContainerStatus {
        match self {
            Self::Initialized => ContainerStatus::Initialized,
            Self::Created(_) => ContainerStatus::Created,
            Self::Started(_) => ContainerStatus::Started,
            Self::Paused(_) => ContainerStatus::Paused,
            Self::Stopped => ContainerStatus::Stopped,
            Self::Errored(_) => ContainerStatus::Errored,
        }
    }
}

/// Live resources of a created pod.
pub(crate) struct PodRuntime {
    pub vm: Arc<dyn VirtualMachineInstance>,
    pub relays: Arc<RelayManager>,
    /// Keeps file-mount staging directories alive for the VM lifetime.
    pub _mounts: ComposedMounts,
    /// Pause process holding the shared PID namespace open, when enabled.
    pub pause: Option<Arc<LinuxProcess>>,
    pub pause_pid: i32,
    /// Started container processes by container id.
    pub processes: HashMap<String, Arc<LinuxProcess>>,
}

/// Phase and container map of a pod, guarded together by the
/// controller's one async mutex.
pub(crate) struct PodState {
    pub phase: PodPhase,
    pub containers: Vec<PodContainerConfig>,
}

impl PodState {
    pub fn new() -> Self {
        Self {
            phase: PodPhase::Initialized,
            containers: Vec::new(),
        }
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.id.clone()).collect()
    }
}

/// Phase of a pod controller.
pub(crate) enum PodPhase {
    Initialized,
    Created(PodRuntime),
    Started(PodRuntime),
    Paused(PodRuntime),
    Stopped,
    Errored(VesselError),
}

impl PodPhase {
    pub fn status(&self) -> ContainerStatus {
        match self {
            Self::Initialized => ContainerStatus::Initialized,
            Self::Created(_) => ContainerStatus::Created,
            Self::Started(_) => ContainerStatus::Started,
            Self::Paused(_) => ContainerStatus::Paused,
            Self::Stopped => ContainerStatus::Stopped,
            Self::Errored(_) => ContainerStatus::Errored,
        }
    }
}
