//! Single-container controller.

use std::sync::Arc;
use std::time::Duration;

use vessel_shared::{VesselError, VesselResult};

use super::config::ContainerConfiguration;
use super::setup;
use super::spec::{RuntimeSpecParams, build_runtime_spec, rootfs_path};
use super::state::{ContainerPhase, ContainerRuntime, ContainerStatus};
use crate::agent::{ContainerStatistics, KILL_ALL, ProcessOptions};
use crate::mounts::{ComposedMounts, MountComposer, WorkloadMounts};
use crate::process::{ExitStatus, LinuxProcess, ProcessStdio};
use crate::relay::RelayManager;
use crate::vm::{VirtualMachineInstance, VirtualMachineManager, VmConfiguration, VmState};

/// Grace window for the init process to exit after kill-all.
const STOP_WAIT_LEEWAY: Duration = Duration::from_secs(5);

/// A Linux container in its own VM.
///
/// Lifecycle: `initialized → created → started → stopped`, `paused`
/// reachable from `started`, and a sticky `errored` branch. A stopped
/// container may be created again; the new VM carries fresh resources and
/// the same configuration.
///
/// Public methods serialize on one async mutex and may suspend while
/// holding it. `wait`, `kill` and `resize` only snapshot the process
/// handle under the lock so `stop` stays reachable while they block.
pub struct LinuxContainer {
    config: ContainerConfiguration,
    vmm: Arc<dyn VirtualMachineManager>,
    state: tokio::sync::Mutex<ContainerPhase>,
}

impl LinuxContainer {
    pub fn new(config: ContainerConfiguration, vmm: Arc<dyn VirtualMachineManager>) -> Self {
        Self {
            config,
            vmm,
            state: tokio::sync::Mutex::new(ContainerPhase::Initialized),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn configuration(&self) -> &ContainerConfiguration {
        &self.config
    }

    pub async fn status(&self) -> ContainerStatus {
        self.state.lock().await.status()
    }

    /// Build and boot the VM, run guest setup, start relays.
    pub async fn create(&self) -> VesselResult<()> {
        let mut phase = self.state.lock().await;
        match &*phase {
            ContainerPhase::Initialized | ContainerPhase::Stopped => {}
            ContainerPhase::Errored(err) => return Err(err.clone()),
            other => {
                return Err(VesselError::InvalidState(format!(
                    "cannot create container {} in status {:?}",
                    self.config.id,
                    other.status()
                )));
            }
        }

        match self.create_runtime().await {
            Ok(runtime) => {
                *phase = ContainerPhase::Created(runtime);
                tracing::info!(container_id = %self.config.id, "container created");
                Ok(())
            }
            Err(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    async fn create_runtime(&self) -> VesselResult<ContainerRuntime> {
        let workloads = vec![WorkloadMounts {
            id: self.config.id.clone(),
            rootfs: self.config.rootfs.clone(),
            mounts: self.config.mounts.clone(),
        }];
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
        if let Err(err) = self.guest_setup(&vm, &relays, &composed).await {
            // Roll back the relays and the VM before surfacing the error.
            relays.stop_all().await;
            if let Err(stop_err) = vm.stop().await {
                tracing::warn!(error = %stop_err, "VM rollback failed");
            }
            return Err(err);
        }

        Ok(ContainerRuntime {
            vm,
            relays,
            _mounts: composed,
            process: None,
        })
    }

    async fn guest_setup(
        &self,
        vm: &Arc<dyn VirtualMachineInstance>,
        relays: &Arc<RelayManager>,
        composed: &ComposedMounts,
    ) -> VesselResult<()> {
        let agent = vm.dial_agent().await?;
        let result = async {
            agent.standard_setup().await?;

            let plan = composed.container(&self.config.id).ok_or_else(|| {
                VesselError::internal(format!("no mount plan for container {}", self.config.id))
            })?;
            setup::mount_container_filesystems(agent.as_ref(), plan, &self.config.id).await?;
            setup::setup_networking(agent.as_ref(), &self.config.interfaces).await?;
            setup::configure_resolver(
                agent.as_ref(),
                self.config.dns.as_ref(),
                self.config.hosts.as_ref(),
                &self.config.id,
            )
            .await?;
            setup::start_relays(agent.as_ref(), relays, &self.config.sockets).await?;
            Ok(())
        }
        .await;

        if let Err(err) = agent.close().await {
            tracing::debug!(error = %err, "agent channel close failed");
        }
        result
    }

    /// Create and start the init process; returns its guest pid.
    pub async fn start(&self, stdio: ProcessStdio) -> VesselResult<i32> {
        let mut phase = self.state.lock().await;
        let mut runtime = match std::mem::replace(&mut *phase, ContainerPhase::Stopped) {
            ContainerPhase::Created(runtime) => runtime,
            ContainerPhase::Errored(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                return Err(err);
            }
            other => {
                let status = other.status();
                *phase = other;
                return Err(VesselError::InvalidState(format!(
                    "cannot start container {} in status {status:?}",
                    self.config.id
                )));
            }
        };

        match self.start_init_process(&runtime, stdio).await {
            Ok((process, pid)) => {
                runtime.process = Some(process);
                *phase = ContainerPhase::Started(runtime);
                tracing::info!(container_id = %self.config.id, pid, "container started");
                Ok(pid)
            }
            Err(err) => {
                // The dialed agent channel is closed by the process handle;
                // the VM does not survive a failed start.
                runtime.relays.stop_all().await;
                if let Err(stop_err) = runtime.vm.stop().await {
                    tracing::warn!(error = %stop_err, "VM teardown after failed start failed");
                }
                *phase = ContainerPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    async fn start_init_process(
        &self,
        runtime: &ContainerRuntime,
        stdio: ProcessStdio,
    ) -> VesselResult<(Arc<LinuxProcess>, i32)> {
        let agent = runtime.vm.dial_agent().await?;

        let spec = build_runtime_spec(RuntimeSpecParams {
            container_id: &self.config.id,
            hostname: self.config.hostname.as_deref(),
            sysctl: &self.config.sysctl,
            process: &self.config.process,
            cpus: self.config.cpus,
            memory_bytes: self.config.memory_bytes,
            rootfs_readonly: self.config.rootfs.is_read_only(),
            pod_id: None,
            pid_namespace_path: None,
        })?;

        let process = Arc::new(LinuxProcess::new(
            self.config.id.clone(),
            Some(self.config.id.clone()),
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
        match process.start().await {
            Ok(pid) => Ok((process, pid)),
            Err(err) => {
                let _ = process.delete().await;
                Err(err)
            }
        }
    }

    /// Stop everything: relays first (guest sockets pin the rootfs), then
    /// kill-all, a bounded wait for init, rootfs unmount, VM stop.
    /// Idempotent: stopping a stopped container succeeds.
    pub async fn stop(&self) -> VesselResult<()> {
        let mut phase = self.state.lock().await;
        let runtime = match std::mem::replace(&mut *phase, ContainerPhase::Stopped) {
            ContainerPhase::Stopped => return Ok(()),
            ContainerPhase::Initialized => {
                *phase = ContainerPhase::Initialized;
                return Ok(());
            }
            ContainerPhase::Errored(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                return Err(err);
            }
            ContainerPhase::Created(runtime)
            | ContainerPhase::Started(runtime)
            | ContainerPhase::Paused(runtime) => runtime,
        };

        match self.stop_runtime(runtime).await {
            Ok(()) => {
                tracing::info!(container_id = %self.config.id, "container stopped");
                Ok(())
            }
            Err(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    async fn stop_runtime(&self, runtime: ContainerRuntime) -> VesselResult<()> {
        // A paused VM cannot answer agent RPCs; thaw it for teardown.
        if runtime.vm.state() == VmState::Paused {
            if let Err(err) = runtime.vm.resume().await {
                tracing::warn!(error = %err, "resume before stop failed");
            }
        }

        let relay_configs = runtime.relays.configs().await;

        if runtime.vm.state() == VmState::Running && runtime.process.is_some() {
            let agent = runtime.vm.dial_agent().await?;
            let result: VesselResult<()> = async {
                setup::stop_guest_relays(agent.as_ref(), &relay_configs).await;
                runtime.relays.stop_all().await;

                agent.kill(KILL_ALL, libc::SIGKILL).await?;
                if let Some(process) = &runtime.process {
                    if let Err(err) = agent
                        .wait_process(
                            process.id(),
                            Some(&self.config.id),
                            Some(STOP_WAIT_LEEWAY),
                        )
                        .await
                    {
                        tracing::warn!(error = %err, "init did not report exit before teardown");
                    }
                }
                agent.umount(&rootfs_path(&self.config.id), 0).await?;
                Ok(())
            }
            .await;
            if let Err(err) = agent.close().await {
                tracing::debug!(error = %err, "agent channel close failed");
            }
            result?;
        } else {
            // Created-but-never-started, or the VM died behind our back.
            if !relay_configs.is_empty() && runtime.vm.state() == VmState::Running {
                if let Ok(agent) = runtime.vm.dial_agent().await {
                    setup::stop_guest_relays(agent.as_ref(), &relay_configs).await;
                    let _ = agent.close().await;
                }
            }
            runtime.relays.stop_all().await;
        }

        if let Some(process) = &runtime.process {
            if let Err(err) = process.delete().await {
                tracing::warn!(error = %err, "process deletion during stop failed");
            }
        }

        runtime.vm.stop().await?;
        Ok(())
    }

    pub async fn pause(&self) -> VesselResult<()> {
        let mut phase = self.state.lock().await;
        let runtime = match std::mem::replace(&mut *phase, ContainerPhase::Stopped) {
            ContainerPhase::Started(runtime) => runtime,
            ContainerPhase::Errored(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                return Err(err);
            }
            other => {
                let status = other.status();
                *phase = other;
                return Err(VesselError::InvalidState(format!(
                    "cannot pause container {} in status {status:?}",
                    self.config.id
                )));
            }
        };

        match runtime.vm.pause().await {
            Ok(()) => {
                *phase = ContainerPhase::Paused(runtime);
                Ok(())
            }
            Err(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    pub async fn resume(&self) -> VesselResult<()> {
        let mut phase = self.state.lock().await;
        let runtime = match std::mem::replace(&mut *phase, ContainerPhase::Stopped) {
            ContainerPhase::Paused(runtime) => runtime,
            ContainerPhase::Errored(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                return Err(err);
            }
            other => {
                let status = other.status();
                *phase = other;
                return Err(VesselError::InvalidState(format!(
                    "cannot resume container {} in status {status:?}",
                    self.config.id
                )));
            }
        };

        match runtime.vm.resume().await {
            Ok(()) => {
                *phase = ContainerPhase::Started(runtime);
                Ok(())
            }
            Err(err) => {
                *phase = ContainerPhase::Errored(err.clone());
                Err(err)
            }
        }
    }

    /// Snapshot the started init process without holding the lock across
    /// the caller's RPC.
    async fn started_process(&self, op: &str) -> VesselResult<Arc<LinuxProcess>> {
        let phase = self.state.lock().await;
        match &*phase {
            ContainerPhase::Started(runtime) => runtime
                .process
                .clone()
                .ok_or_else(|| VesselError::internal("started container has no process")),
            ContainerPhase::Errored(err) => Err(err.clone()),
            other => Err(VesselError::InvalidState(format!(
                "cannot {op} container {} in status {:?}",
                self.config.id,
                other.status()
            ))),
        }
    }

    pub async fn kill(&self, signal: i32) -> VesselResult<()> {
        let process = self.started_process("kill").await?;
        process.signal(signal).await
    }

    pub async fn resize(&self, rows: u16, cols: u16) -> VesselResult<()> {
        let process = self.started_process("resize").await?;
        process.resize(rows, cols).await
    }

    /// Wait for the init process to exit. Runs outside the controller
    /// lock; a concurrent `stop` surfaces here as an RPC error from the
    /// closing channel.
    pub async fn wait(&self, timeout: Option<Duration>) -> VesselResult<ExitStatus> {
        let process = self.started_process("wait").await?;
        process.wait(timeout).await
    }

    pub async fn statistics(&self) -> VesselResult<ContainerStatistics> {
        let vm = {
            let phase = self.state.lock().await;
            match &*phase {
                ContainerPhase::Created(runtime)
                | ContainerPhase::Started(runtime)
                | ContainerPhase::Paused(runtime) => Arc::clone(&runtime.vm),
                ContainerPhase::Errored(err) => return Err(err.clone()),
                other => {
                    return Err(VesselError::InvalidState(format!(
                        "cannot read statistics of container {} in status {:?}",
                        self.config.id,
                        other.status()
                    )));
                }
            }
        };

        let agent = vm.dial_agent().await?;
        let result = agent
            .container_statistics(std::slice::from_ref(&self.config.id))
            .await;
        let _ = agent.close().await;

        result?.into_iter().next().ok_or_else(|| {
            VesselError::NotFound(format!(
                "no statistics for container {}",
                self.config.id
            ))
        })
    }
}
