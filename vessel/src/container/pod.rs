//! Pod controller: several containers sharing one VM.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vessel_shared::{VesselError, VesselResult};

use super::config::{PodConfiguration, PodContainerConfig, ProcessConfiguration};
use super::setup;
use super::spec::{RuntimeSpecParams, build_runtime_spec, pause_container_id, rootfs_path};
use super::state::{ContainerStatus, PodPhase, PodRuntime, PodState};
use crate::agent::{ContainerStatistics, KILL_ALL, ProcessOptions};
use crate::mounts::{AttachedFilesystem, ComposedMounts, MountComposer, WorkloadMounts};
use crate::process::{ExitStatus, LinuxProcess, ProcessStdio};
use crate::relay::RelayManager;
use crate::vm::{VirtualMachineInstance, VirtualMachineManager, VmConfiguration, VmState};

const STOP_WAIT_LEEWAY: Duration = Duration::from_secs(5);

/// A pod of Linux containers in one VM.
///
/// Containers are registered while the pod is `initialized`; `create`
/// boots the shared VM and mounts every member's filesystems. With a
/// shared PID namespace enabled, the pause container starts before any
/// member and every member joins `/proc/{pause_pid}/ns/pid`.
///
/// The phase and the container map live behind one async mutex; every
/// public method serializes on it.
pub struct LinuxPod {
    config: PodConfiguration,
    vmm: Arc<dyn VirtualMachineManager>,
    state: tokio::sync::Mutex<PodState>,
}

impl LinuxPod {
    pub fn new(config: PodConfiguration, vmm: Arc<dyn VirtualMachineManager>) -> Self {
        Self {
            config,
            vmm,
            state: tokio::sync::Mutex::new(PodState::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub async fn status(&self) -> ContainerStatus {
        self.state.lock().await.phase.status()
    }

    pub async fn container_ids(&self) -> Vec<String> {
        self.state.lock().await.container_ids()
    }

    /// Register a container. Only possible before `create`.
    pub async fn add_container(&self, container: PodContainerConfig) -> VesselResult<()> {
        let mut state = self.state.lock().await;
        if !matches!(state.phase, PodPhase::Initialized) {
            return Err(VesselError::InvalidState(format!(
                "cannot add container to pod {} in status {:?}",
                self.config.id,
                state.phase.status()
            )));
        }

        if state.containers.iter().any(|c| c.id == container.id) {
            return Err(VesselError::Exists(format!(
                "container {} already in pod {}",
                container.id, self.config.id
            )));
        }
        state.containers.push(container);
        Ok(())
    }

    /// Boot the shared VM, mount every member, bring up networking, start
    /// relays.
    pub async fn create(&self) -> VesselResult<()> {
        let mut state = self.state.lock().await;
        match &state.phase {
            PodPhase::Initialized | PodPhase::Stopped => {}
            PodPhase::Errored(err) => return Err(err.clone()),
            other => {
                return Err(VesselError::InvalidState(format!(
                    "cannot create pod {} in status {:?}",
                    self.config.id,
                    other.status()
                )));
            }
        }

        let containers = state.containers.clone();
        match self.create_runtime(&containers).await {
            Ok(runtime) => {
                state.phase = PodPhase::Created(runtime);
                tracing::info!(pod_id = %self.config.id, "pod created");
                Ok(())
            }
            Err(err) => {
                state.phase = PodPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    async fn create_runtime(&self, containers: &[PodContainerConfig]) -> VesselResult<PodRuntime> {
        if containers.is_empty() {
            return Err(VesselError::InvalidArgument(format!(
                "pod {} has no containers",
                self.config.id
            )));
        }

        let workloads: Vec<WorkloadMounts> = containers
            .iter()
            .map(|c| WorkloadMounts {
                id: c.id.clone(),
                rootfs: c.rootfs.clone(),
                mounts: c.mounts.clone(),
            })
            .collect();
        let composed = MountComposer::new().compose(workloads.clone())?;

        let vm_config = VmConfiguration {
            cpus: self.config.cpus,
            memory_bytes: self.config.memory_bytes,
            interfaces: self.config.interfaces.clone(),
            workloads,
            boot_log: self.config.boot_log.clone(),
            nested_virtualization: self.config.nested_virtualization,
            kernel: self.config.kernel.clone(),
            rosetta: self.config.rosetta,
        };

        let vm = self.vmm.create_instance(&vm_config, &composed).await?;
        vm.start().await?;

        let relays = Arc::new(RelayManager::new(Arc::clone(&vm)));
        if let Err(err) = self.guest_setup(&vm, &relays, &composed, containers).await {
            relays.stop_all().await;
            if let Err(stop_err) = vm.stop().await {
                tracing::warn!(error = %stop_err, "VM rollback failed");
            }
            return Err(err);
        }

        Ok(PodRuntime {
            vm,
            relays,
            _mounts: composed,
            pause: None,
            pause_pid: 0,
            processes: HashMap::new(),
        })
    }

    async fn guest_setup(
        &self,
        vm: &Arc<dyn VirtualMachineInstance>,
        relays: &Arc<RelayManager>,
        composed: &ComposedMounts,
        containers: &[PodContainerConfig],
    ) -> VesselResult<()> {
        let agent = vm.dial_agent().await?;
        let result = async {
            agent.standard_setup().await?;

            for container in containers {
                let plan = composed.container(&container.id).ok_or_else(|| {
                    VesselError::internal(format!("no mount plan for container {}", container.id))
                })?;
                setup::mount_container_filesystems(agent.as_ref(), plan, &container.id).await?;
            }

            setup::setup_networking(agent.as_ref(), &self.config.interfaces).await?;
            for container in containers {
                setup::configure_resolver(
                    agent.as_ref(),
                    self.config.dns.as_ref(),
                    self.config.hosts.as_ref(),
                    &container.id,
                )
                .await?;
            }

            setup::start_relays(agent.as_ref(), relays, &self.config.sockets).await?;
            Ok(())
        }
        .await;

        if let Err(err) = agent.close().await {
            tracing::debug!(error = %err, "agent channel close failed");
        }
        result
    }

    /// Start the pause container if the pod shares a PID namespace and it
    /// is not running yet. Its pid is observed before any member starts.
    async fn ensure_pause(&self, runtime: &mut PodRuntime) -> VesselResult<()> {
        if !self.config.share_process_namespace || runtime.pause_pid > 0 {
            return Ok(());
        }

        let pause_id = pause_container_id(&self.config.id);
        let pause_rootfs = rootfs_path(&pause_id);

        let agent = runtime.vm.dial_agent().await?;
        let mount_result = async {
            agent
                .mkdir(&format!("{pause_rootfs}/sbin"), true, 0o755)
                .await?;
            agent
                .mount(&AttachedFilesystem {
                    fs_type: "bind".to_string(),
                    source: "/sbin".to_string(),
                    destination: format!("{pause_rootfs}/sbin"),
                    options: vec!["bind".to_string(), "ro".to_string()],
                    is_file_bind: false,
                })
                .await
        }
        .await;
        if let Err(err) = mount_result {
            let _ = agent.close().await;
            return Err(err);
        }

        let process_config =
            ProcessConfiguration::new(vec!["/sbin/vminitd".to_string(), "pause".to_string()]);
        let sysctl = HashMap::new();
        let spec = build_runtime_spec(RuntimeSpecParams {
            container_id: &pause_id,
            hostname: None,
            sysctl: &sysctl,
            process: &process_config,
            cpus: 1,
            memory_bytes: 64 << 20,
            rootfs_readonly: false,
            pod_id: Some(&self.config.id),
            pid_namespace_path: None,
        })?;

        let process = Arc::new(LinuxProcess::new(
            pause_id.clone(),
            Some(pause_id.clone()),
            spec,
            ProcessOptions::default(),
            ProcessStdio::none(),
            Arc::clone(&runtime.vm),
            agent,
        )?);

        if let Err(err) = process.create().await {
            let _ = process.delete().await;
            return Err(err);
        }
        let pid = match process.start().await {
            Ok(pid) => pid,
            Err(err) => {
                let _ = process.delete().await;
                return Err(err);
            }
        };

        tracing::info!(pod_id = %self.config.id, pause_pid = pid, "pause container started");
        runtime.pause = Some(process);
        runtime.pause_pid = pid;
        Ok(())
    }

    async fn start_member(
        &self,
        runtime: &mut PodRuntime,
        container_id: &str,
        config: Option<PodContainerConfig>,
        stdio: ProcessStdio,
    ) -> VesselResult<i32> {
        self.ensure_pause(runtime).await?;

        if runtime.processes.contains_key(container_id) {
            return Err(VesselError::Exists(format!(
                "container {container_id} already started"
            )));
        }

        let config = config.ok_or_else(|| {
            VesselError::NotFound(format!(
                "container {container_id} is not part of pod {}",
                self.config.id
            ))
        })?;

        let pid_namespace_path = (runtime.pause_pid > 0)
            .then(|| format!("/proc/{}/ns/pid", runtime.pause_pid));

        let agent = runtime.vm.dial_agent().await?;
        let spec = build_runtime_spec(RuntimeSpecParams {
            container_id: &config.id,
            hostname: config.hostname.as_deref(),
            sysctl: &config.sysctl,
            process: &config.process,
            cpus: config.cpus,
            memory_bytes: config.memory_bytes,
            rootfs_readonly: config.rootfs.is_read_only(),
            pod_id: Some(&self.config.id),
            pid_namespace_path,
        })?;

        let process = Arc::new(LinuxProcess::new(
            config.id.clone(),
            Some(config.id.clone()),
            spec,
            ProcessOptions::default(),
            stdio,
            Arc::clone(&runtime.vm),
            agent,
        )?);

        if let Err(err) = process.create().await {
            let _ = process.delete().await;
            return Err(err);
        }
        let pid = match process.start().await {
            Ok(pid) => pid,
            Err(err) => {
                let _ = process.delete().await;
                return Err(err);
            }
        };

        runtime.processes.insert(config.id.clone(), process);
        tracing::info!(pod_id = %self.config.id, container_id = %config.id, pid, "container started");
        Ok(pid)
    }

    /// Start one member; returns its guest pid.
    pub async fn start_container(
        &self,
        container_id: &str,
        stdio: ProcessStdio,
    ) -> VesselResult<i32> {
        let mut state = self.state.lock().await;
        let mut runtime = match std::mem::replace(&mut state.phase, PodPhase::Stopped) {
            PodPhase::Created(runtime) | PodPhase::Started(runtime) => runtime,
            PodPhase::Errored(err) => {
                state.phase = PodPhase::Errored(err.clone());
                return Err(err);
            }
            other => {
                let status = other.status();
                state.phase = other;
                return Err(VesselError::InvalidState(format!(
                    "cannot start container in pod {} in status {status:?}",
                    self.config.id
                )));
            }
        };

        let member = state
            .containers
            .iter()
            .find(|c| c.id == container_id)
            .cloned();

        match self
            .start_member(&mut runtime, container_id, member, stdio)
            .await
        {
            Ok(pid) => {
                state.phase = PodPhase::Started(runtime);
                Ok(pid)
            }
            Err(err) => {
                runtime.relays.stop_all().await;
                if let Err(stop_err) = runtime.vm.stop().await {
                    tracing::warn!(error = %stop_err, "VM teardown after failed start failed");
                }
                state.phase = PodPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    /// Start every registered container, in registration order, without
    /// stdio.
    pub async fn start(&self) -> VesselResult<()> {
        for id in self.container_ids().await {
            self.start_container(&id, ProcessStdio::none()).await?;
        }
        Ok(())
    }

    /// Stop the pod: relays, kill-all, bounded init waits, unmounts, VM.
    /// Idempotent once stopped.
    pub async fn stop(&self) -> VesselResult<()> {
        let mut state = self.state.lock().await;
        let runtime = match std::mem::replace(&mut state.phase, PodPhase::Stopped) {
            PodPhase::Stopped => return Ok(()),
            PodPhase::Initialized => {
                state.phase = PodPhase::Initialized;
                return Ok(());
            }
            PodPhase::Errored(err) => {
                state.phase = PodPhase::Errored(err.clone());
                return Err(err);
            }
            PodPhase::Created(runtime)
            | PodPhase::Started(runtime)
            | PodPhase::Paused(runtime) => runtime,
        };

        let container_ids = state.container_ids();
        match self.stop_runtime(runtime, &container_ids).await {
            Ok(()) => {
                tracing::info!(pod_id = %self.config.id, "pod stopped");
                Ok(())
            }
            Err(err) => {
                state.phase = PodPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    async fn stop_runtime(
        &self,
        runtime: PodRuntime,
        container_ids: &[String],
    ) -> VesselResult<()> {
        if runtime.vm.state() == VmState::Paused {
            if let Err(err) = runtime.vm.resume().await {
                tracing::warn!(error = %err, "resume before stop failed");
            }
        }

        let relay_configs = runtime.relays.configs().await;
        let started = !runtime.processes.is_empty() || runtime.pause.is_some();

        if runtime.vm.state() == VmState::Running {
            let agent = runtime.vm.dial_agent().await?;
            let result: VesselResult<()> = async {
                setup::stop_guest_relays(agent.as_ref(), &relay_configs).await;
                runtime.relays.stop_all().await;

                if started {
                    agent.kill(KILL_ALL, libc::SIGKILL).await?;
                    for (container_id, process) in &runtime.processes {
                        if let Err(err) = agent
                            .wait_process(process.id(), Some(container_id), Some(STOP_WAIT_LEEWAY))
                            .await
                        {
                            tracing::warn!(
                                container_id = %container_id,
                                error = %err,
                                "init did not report exit before teardown"
                            );
                        }
                    }

                    for container_id in container_ids {
                        agent.umount(&rootfs_path(container_id), 0).await?;
                    }
                }
                if runtime.pause.is_some() {
                    let pause_rootfs = rootfs_path(&pause_container_id(&self.config.id));
                    if let Err(err) = agent.umount(&format!("{pause_rootfs}/sbin"), 0).await {
                        tracing::warn!(error = %err, "pause rootfs unmount failed");
                    }
                }
                Ok(())
            }
            .await;
            if let Err(err) = agent.close().await {
                tracing::debug!(error = %err, "agent channel close failed");
            }
            result?;
        } else {
            runtime.relays.stop_all().await;
        }

        for process in runtime.processes.values() {
            if let Err(err) = process.delete().await {
                tracing::warn!(error = %err, "process deletion during stop failed");
            }
        }
        if let Some(pause) = &runtime.pause {
            if let Err(err) = pause.delete().await {
                tracing::warn!(error = %err, "pause deletion during stop failed");
            }
        }

        runtime.vm.stop().await?;
        Ok(())
    }

    pub async fn pause(&self) -> VesselResult<()> {
        let mut state = self.state.lock().await;
        let runtime = match std::mem::replace(&mut state.phase, PodPhase::Stopped) {
            PodPhase::Started(runtime) => runtime,
            PodPhase::Errored(err) => {
                state.phase = PodPhase::Errored(err.clone());
                return Err(err);
            }
            other => {
                let status = other.status();
                state.phase = other;
                return Err(VesselError::InvalidState(format!(
                    "cannot pause pod {} in status {status:?}",
                    self.config.id
                )));
            }
        };

        match runtime.vm.pause().await {
            Ok(()) => {
                state.phase = PodPhase::Paused(runtime);
                Ok(())
            }
            Err(err) => {
                state.phase = PodPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    pub async fn resume(&self) -> VesselResult<()> {
        let mut state = self.state.lock().await;
        let runtime = match std::mem::replace(&mut state.phase, PodPhase::Stopped) {
            PodPhase::Paused(runtime) => runtime,
            PodPhase::Errored(err) => {
                state.phase = PodPhase::Errored(err.clone());
                return Err(err);
            }
            other => {
                let status = other.status();
                state.phase = other;
                return Err(VesselError::InvalidState(format!(
                    "cannot resume pod {} in status {status:?}",
                    self.config.id
                )));
            }
        };

        match runtime.vm.resume().await {
            Ok(()) => {
                state.phase = PodPhase::Started(runtime);
                Ok(())
            }
            Err(err) => {
                state.phase = PodPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    /// Pid of the pause container; 0 when none is running.
    pub async fn pause_pid(&self) -> i32 {
        let state = self.state.lock().await;
        match &state.phase {
            PodPhase::Created(runtime)
            | PodPhase::Started(runtime)
            | PodPhase::Paused(runtime) => runtime.pause_pid,
            _ => 0,
        }
    }

    async fn member_process(
        &self,
        container_id: &str,
        op: &str,
    ) -> VesselResult<Arc<LinuxProcess>> {
        let state = self.state.lock().await;
        match &state.phase {
            PodPhase::Started(runtime) => {
                runtime.processes.get(container_id).cloned().ok_or_else(|| {
                    VesselError::InvalidState(format!(
                        "container {container_id} is not started"
                    ))
                })
            }
            PodPhase::Errored(err) => Err(err.clone()),
            other => Err(VesselError::InvalidState(format!(
                "cannot {op} in pod {} in status {:?}",
                self.config.id,
                other.status()
            ))),
        }
    }

    pub async fn kill_container(&self, container_id: &str, signal: i32) -> VesselResult<()> {
        let process = self.member_process(container_id, "kill").await?;
        process.signal(signal).await
    }

    pub async fn wait_container(
        &self,
        container_id: &str,
        timeout: Option<Duration>,
    ) -> VesselResult<ExitStatus> {
        let process = self.member_process(container_id, "wait").await?;
        process.wait(timeout).await
    }

    pub async fn statistics(&self) -> VesselResult<Vec<ContainerStatistics>> {
        let (vm, container_ids) = {
            let state = self.state.lock().await;
            match &state.phase {
                PodPhase::Created(runtime)
                | PodPhase::Started(runtime)
                | PodPhase::Paused(runtime) => {
                    (Arc::clone(&runtime.vm), state.container_ids())
                }
                PodPhase::Errored(err) => return Err(err.clone()),
                other => {
                    return Err(VesselError::InvalidState(format!(
                        "cannot read statistics of pod {} in status {:?}",
                        self.config.id,
                        other.status()
                    )));
                }
            }
        };

        let agent = vm.dial_agent().await?;
        let result = agent.container_statistics(&container_ids).await;
        let _ = agent.close().await;
        result
    }
}
