//! Subprocess hypervisor backend.
//!
//! Spawns a hypervisor binary as a detached child, handing it the
//! flattened launch configuration as one JSON argument. The guest is
//! reached over AF_VSOCK through the VM's context id. Pause and resume
//! freeze and thaw the whole child process.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};
use vessel_shared::{VesselError, VesselResult};

use super::{HypervisorBackend, HypervisorState};
use crate::vm::config::{BootLog, HypervisorLaunchConfig};
use crate::vm::vsock::{VsockConnection, dup_fd};

/// Wildcard context id for host-side listeners.
const CID_ANY: u32 = u32::MAX;

/// Grace period between SIGTERM and SIGKILL at stop.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct ChildHypervisor {
    binary: PathBuf,
    launch: HypervisorLaunchConfig,
    boot_log: Option<BootLog>,
    context_id: u32,
    state: RwLock<HypervisorState>,
    child: tokio::sync::Mutex<Option<Child>>,
    listeners: Mutex<HashMap<u32, Arc<Notify>>>,
}

impl ChildHypervisor {
    pub fn new(
        binary: impl Into<PathBuf>,
        launch: HypervisorLaunchConfig,
        boot_log: Option<BootLog>,
        context_id: u32,
    ) -> Self {
        Self {
            binary: binary.into(),
            launch,
            boot_log,
            context_id,
            state: RwLock::new(HypervisorState::Stopped),
            child: tokio::sync::Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    fn set_state(&self, state: HypervisorState) {
        *self.state.write() = state;
    }

    /// Serial console destination for the child's stdout/stderr.
    fn console_stdio(&self) -> VesselResult<(Stdio, Stdio)> {
        match &self.boot_log {
            None => Ok((Stdio::null(), Stdio::null())),
            Some(BootLog::File { path, truncate }) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(!truncate)
                    .truncate(*truncate)
                    .open(path)
                    .map_err(|err| {
                        VesselError::internal_with(
                            format!("cannot open boot log {}", path.display()),
                            err,
                        )
                    })?;
                let err_file = file.try_clone().map_err(VesselError::from)?;
                Ok((Stdio::from(file), Stdio::from(err_file)))
            }
            Some(BootLog::Fd(fd)) => {
                let out = dup_fd(fd.as_raw_fd()).map_err(VesselError::from)?;
                let err = dup_fd(fd.as_raw_fd()).map_err(VesselError::from)?;
                Ok((Stdio::from(out), Stdio::from(err)))
            }
        }
    }

    fn signal_child(&self, pid: u32, signal: i32) -> VesselResult<()> {
        let rc = unsafe { libc::kill(pid as i32, signal) };
        if rc != 0 {
            return Err(VesselError::internal_with(
                format!("kill({pid}, {signal}) failed"),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorBackend for ChildHypervisor {
    fn state(&self) -> HypervisorState {
        *self.state.read()
    }

    async fn start(&self) -> VesselResult<()> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_some() {
            return Err(VesselError::InvalidState(
                "hypervisor already running".to_string(),
            ));
        }
        self.set_state(HypervisorState::Starting);

        let config_json = serde_json::to_string(&self.launch)?;
        let (stdout, stderr) = self.console_stdio().inspect_err(|_| {
            self.set_state(HypervisorState::Stopped);
        })?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--context-id")
            .arg(self.context_id.to_string())
            .arg("--config")
            .arg(config_json)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        match cmd.spawn() {
            Ok(child) => {
                tracing::info!(
                    binary = %self.binary.display(),
                    context_id = self.context_id,
                    pid = ?child.id(),
                    "spawned hypervisor"
                );
                *child_slot = Some(child);
                self.set_state(HypervisorState::Running);
                Ok(())
            }
            Err(err) => {
                self.set_state(HypervisorState::Stopped);
                Err(VesselError::internal_with(
                    format!("failed to spawn hypervisor {}", self.binary.display()),
                    err,
                ))
            }
        }
    }

    async fn stop(&self) -> VesselResult<()> {
        let mut child_slot = self.child.lock().await;
        let Some(mut child) = child_slot.take() else {
            self.set_state(HypervisorState::Stopped);
            return Ok(());
        };
        self.set_state(HypervisorState::Stopping);

        if let Some(pid) = child.id() {
            let _ = self.signal_child(pid, libc::SIGTERM);
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(?status, "hypervisor exited");
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "wait on hypervisor failed");
                }
                Err(_) => {
                    tracing::warn!(pid, "hypervisor ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }

        self.set_state(HypervisorState::Stopped);
        Ok(())
    }

    async fn pause(&self) -> VesselResult<()> {
        let child_slot = self.child.lock().await;
        let pid = child_slot
            .as_ref()
            .and_then(Child::id)
            .ok_or_else(|| VesselError::InvalidState("hypervisor not running".to_string()))?;
        self.signal_child(pid, libc::SIGSTOP)?;
        self.set_state(HypervisorState::Paused);
        Ok(())
    }

    async fn resume(&self) -> VesselResult<()> {
        let child_slot = self.child.lock().await;
        let pid = child_slot
            .as_ref()
            .and_then(Child::id)
            .ok_or_else(|| VesselError::InvalidState("hypervisor not running".to_string()))?;
        self.signal_child(pid, libc::SIGCONT)?;
        self.set_state(HypervisorState::Running);
        Ok(())
    }

    async fn connect(&self, port: u32) -> VesselResult<VsockConnection> {
        let stream = VsockStream::connect(VsockAddr::new(self.context_id, port))
            .await
            .map_err(|err| {
                VesselError::internal_with(
                    format!("vsock connect to {}:{port} failed", self.context_id),
                    err,
                )
            })?;

        let fd = dup_fd(stream.as_raw_fd()).map_err(VesselError::from)?;
        Ok(VsockConnection::retained(fd, Arc::new(stream)))
    }

    async fn listen(&self, port: u32) -> VesselResult<super::ConnectionStream> {
        let closed = {
            let mut listeners = self.listeners.lock();
            if listeners.contains_key(&port) {
                return Err(VesselError::Exists(format!(
                    "vsock listener already bound on port {port}"
                )));
            }
            let notify = Arc::new(Notify::new());
            listeners.insert(port, Arc::clone(&notify));
            notify
        };

        let listener = VsockListener::bind(VsockAddr::new(CID_ANY, port)).map_err(|err| {
            self.listeners.lock().remove(&port);
            VesselError::internal_with(format!("vsock bind on port {port} failed"), err)
        })?;

        let stream = async_stream::stream! {
            let mut listener = listener;
            loop {
                tokio::select! {
                    _ = closed.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::trace!(?peer, "accepted vsock connection");
                            match dup_fd(stream.as_raw_fd()) {
                                Ok(fd) => yield Ok(VsockConnection::retained(fd, Arc::new(stream))),
                                Err(err) => {
                                    yield Err(VesselError::from(err));
                                    break;
                                }
                            }
                        }
                        Err(err) => {
                            yield Err(VesselError::internal_with("vsock accept failed", err));
                            break;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn close_listener(&self, port: u32) -> VesselResult<()> {
        if let Some(notify) = self.listeners.lock().remove(&port) {
            notify.notify_one();
        }
        Ok(())
    }
}
