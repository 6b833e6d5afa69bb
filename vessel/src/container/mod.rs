//! Container and pod lifecycle.
//!
//! The public API of the orchestrator: configure a container (or a pod of
//! containers sharing one VM), then drive it through
//! `initialized → created → started → stopped`, with `paused` on the side
//! and a sticky `errored` branch. All public methods on one controller are
//! serialized by a single async mutex; process-level waits run outside it
//! so `stop` stays reachable.

mod config;
mod container;
mod pod;
mod setup;
mod spec;
mod state;

pub use config::{
    ContainerConfiguration, PodConfiguration, PodContainerConfig, ProcessConfiguration, Rlimit,
    UserSpec,
};
pub use container::LinuxContainer;
pub use pod::LinuxPod;
pub use spec::{cgroup_path, default_mounts, pause_container_id, rootfs_path};
pub use state::ContainerStatus;
