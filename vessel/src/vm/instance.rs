//! The VM instance state machine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vessel_shared::{VesselError, VesselResult, vsock::AGENT_PORT};

use super::backend::{HypervisorBackend, HypervisorState};
use super::config::VmConfiguration;
use super::timesync::TimeSyncer;
use super::vsock::{VsockAcceptStream, VsockConnection};
use crate::agent::VirtualMachineAgent;
use crate::mounts::ComposedMounts;

/// Lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Paused,
    /// Any hypervisor state we do not model. Operations from here fail.
    Unknown,
}

impl From<HypervisorState> for VmState {
    fn from(state: HypervisorState) -> Self {
        match state {
            HypervisorState::Stopped => Self::Stopped,
            HypervisorState::Starting => Self::Starting,
            HypervisorState::Running => Self::Running,
            HypervisorState::Stopping => Self::Stopping,
            HypervisorState::Paused => Self::Paused,
            HypervisorState::Unknown => Self::Unknown,
        }
    }
}

/// Builds an agent RPC handle from a freshly dialed vsock connection.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn connect(
        &self,
        connection: VsockConnection,
    ) -> VesselResult<Box<dyn VirtualMachineAgent>>;
}

/// A running (or runnable) virtual machine.
#[async_trait]
pub trait VirtualMachineInstance: Send + Sync {
    fn state(&self) -> VmState;

    async fn start(&self) -> VesselResult<()>;

    async fn stop(&self) -> VesselResult<()>;

    async fn pause(&self) -> VesselResult<()>;

    async fn resume(&self) -> VesselResult<()>;

    /// A fresh agent handle over a new vsock connection.
    async fn dial_agent(&self) -> VesselResult<Box<dyn VirtualMachineAgent>>;

    /// Dial an arbitrary guest port.
    async fn dial(&self, port: u32) -> VesselResult<VsockConnection>;

    /// Open a listener; the guest connects to `port`.
    async fn listen(&self, port: u32) -> VesselResult<VsockAcceptStream>;
}

/// Creates VM instances from composed configurations.
#[async_trait]
pub trait VirtualMachineManager: Send + Sync {
    async fn create_instance(
        &self,
        config: &VmConfiguration,
        mounts: &ComposedMounts,
    ) -> VesselResult<Arc<dyn VirtualMachineInstance>>;
}

/// Agent readiness poll: attempts x delay bounds how long boot may take.
const AGENT_DIAL_ATTEMPTS: u32 = 150;
const AGENT_DIAL_DELAY: Duration = Duration::from_millis(20);

/// Default [`VirtualMachineInstance`] over a [`HypervisorBackend`].
///
/// All operations are serialized by one async lock; long operations
/// (agent readiness poll) suspend while holding it.
pub struct VmInstance {
    backend: Arc<dyn HypervisorBackend>,
    agents: Arc<dyn AgentFactory>,
    rosetta: bool,
    lock: tokio::sync::Mutex<()>,
    time_syncer: TimeSyncer,
}

impl VmInstance {
    pub fn new(
        backend: Arc<dyn HypervisorBackend>,
        agents: Arc<dyn AgentFactory>,
        rosetta: bool,
    ) -> Self {
        Self {
            backend,
            agents,
            rosetta,
            lock: tokio::sync::Mutex::new(()),
            time_syncer: TimeSyncer::new(),
        }
    }

    fn ensure_state(&self, wanted: VmState, op: &str) -> VesselResult<()> {
        let current = VmState::from(self.backend.state());
        if current != wanted {
            return Err(VesselError::InvalidState(format!(
                "cannot {op} a VM in state {current:?}"
            )));
        }
        Ok(())
    }

    /// Dial the agent port until the guest supervisor answers.
    async fn poll_agent(&self) -> VesselResult<()> {
        for _ in 0..AGENT_DIAL_ATTEMPTS {
            match self.backend.connect(AGENT_PORT).await {
                Ok(probe) => {
                    drop(probe);
                    return Ok(());
                }
                Err(_) => tokio::time::sleep(AGENT_DIAL_DELAY).await,
            }
        }
        Err(VesselError::InvalidArgument(
            "no connection to agent socket".to_string(),
        ))
    }
}

#[async_trait]
impl VirtualMachineInstance for VmInstance {
    fn state(&self) -> VmState {
        VmState::from(self.backend.state())
    }

    async fn start(&self) -> VesselResult<()> {
        let _guard = self.lock.lock().await;
        self.ensure_state(VmState::Stopped, "start")?;

        self.backend.prepare().await?;
        self.backend.start().await?;

        if let Err(err) = self.poll_agent().await {
            tracing::warn!(error = %err, "guest agent never came up, stopping VM");
            let _ = self.backend.stop().await;
            return Err(err);
        }

        if self.rosetta {
            let conn = self.backend.connect(AGENT_PORT).await?;
            let agent = self.agents.connect(conn).await?;
            let result = agent.enable_rosetta().await;
            let _ = agent.close().await;
            result?;
        }

        self.time_syncer
            .start(Arc::clone(&self.backend), Arc::clone(&self.agents));

        tracing::info!("virtual machine started");
        Ok(())
    }

    async fn stop(&self) -> VesselResult<()> {
        let _guard = self.lock.lock().await;
        match VmState::from(self.backend.state()) {
            // Already stopped (possibly behind our back); not an error.
            VmState::Stopped => return Ok(()),
            VmState::Running | VmState::Paused => {}
            other => {
                return Err(VesselError::InvalidState(format!(
                    "cannot stop a VM in state {other:?}"
                )));
            }
        }

        self.time_syncer.stop();
        self.backend.stop().await?;
        tracing::info!("virtual machine stopped");
        Ok(())
    }

    async fn pause(&self) -> VesselResult<()> {
        let _guard = self.lock.lock().await;
        self.ensure_state(VmState::Running, "pause")?;
        self.backend.pause().await?;
        self.time_syncer.pause();
        Ok(())
    }

    async fn resume(&self) -> VesselResult<()> {
        let _guard = self.lock.lock().await;
        self.ensure_state(VmState::Paused, "resume")?;
        self.backend.resume().await?;
        self.time_syncer.resume();
        Ok(())
    }

    async fn dial_agent(&self) -> VesselResult<Box<dyn VirtualMachineAgent>> {
        self.ensure_state(VmState::Running, "dial the agent of")?;
        let conn = self.backend.connect(AGENT_PORT).await?;
        self.agents.connect(conn).await
    }

    async fn dial(&self, port: u32) -> VesselResult<VsockConnection> {
        self.ensure_state(VmState::Running, "dial")?;
        self.backend.connect(port).await
    }

    async fn listen(&self, port: u32) -> VesselResult<VsockAcceptStream> {
        self.ensure_state(VmState::Running, "listen on")?;
        let stream = self.backend.listen(port).await?;
        Ok(VsockAcceptStream::new(
            port,
            stream,
            Arc::clone(&self.backend),
        ))
    }
}

impl Drop for VmInstance {
    fn drop(&mut self) {
        self.time_syncer.stop();
    }
}
