//! The host-side process handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use oci_spec::runtime::Spec;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use vessel_shared::{VesselError, VesselResult};

use crate::agent::{ProcessOptions, StdioPorts, VirtualMachineAgent};
use crate::process::ports::allocate_host_port;
use crate::process::stdio::{
    IoTracker, ProcessStdio, spawn_output_pump, spawn_stdin_pump,
};
use crate::util::with_timeout;
use crate::vm::{VirtualMachineInstance, VsockAcceptStream, VsockConnection};

/// How long the guest gets to dial back every stdio port.
const STDIO_ACCEPT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long `wait` blocks for output streams to reach EOF after exit.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Exit status of an in-guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessPhase {
    Configured,
    Created,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StdioKind {
    Stdin,
    Stdout,
    Stderr,
}

/// A Linux process inside the guest, controlled over the agent channel.
///
/// The handle owns its agent channel; it is released by [`delete`]
/// (idempotent, the cleanup runs once no matter how many callers race).
///
/// [`delete`]: LinuxProcess::delete
pub struct LinuxProcess {
    id: String,
    container_id: Option<String>,
    vm: Arc<dyn VirtualMachineInstance>,
    agent: Box<dyn VirtualMachineAgent>,
    options: ProcessOptions,
    ports: StdioPorts,
    spec: Mutex<Spec>,
    stdio: Mutex<Option<ProcessStdio>>,
    phase: tokio::sync::Mutex<ProcessPhase>,
    pid: AtomicI32,
    stdin_closed: Arc<AtomicBool>,
    stdin_task: Mutex<Option<JoinHandle<()>>>,
    output_tasks: Mutex<Vec<JoinHandle<()>>>,
    tracker: Mutex<Option<IoTracker>>,
    deletion: tokio::sync::OnceCell<VesselResult<()>>,
}

fn wants_terminal(spec: &Spec) -> bool {
    spec.process()
        .as_ref()
        .map(|p| matches!(p.terminal(), Some(true)))
        .unwrap_or(false)
}

impl LinuxProcess {
    /// Allocate ports for the configured streams and build the handle.
    ///
    /// Terminal mode forbids a stderr stream: the pty already carries both
    /// output streams.
    pub fn new(
        id: impl Into<String>,
        container_id: Option<String>,
        spec: Spec,
        options: ProcessOptions,
        stdio: ProcessStdio,
        vm: Arc<dyn VirtualMachineInstance>,
        agent: Box<dyn VirtualMachineAgent>,
    ) -> VesselResult<Self> {
        if wants_terminal(&spec) && stdio.stderr.is_some() {
            return Err(VesselError::InvalidArgument(
                "terminal mode forbids a stderr stream".to_string(),
            ));
        }

        let ports = StdioPorts {
            stdin: stdio.stdin.as_ref().map(|_| allocate_host_port()),
            stdout: stdio.stdout.as_ref().map(|_| allocate_host_port()),
            stderr: stdio.stderr.as_ref().map(|_| allocate_host_port()),
        };

        Ok(Self {
            id: id.into(),
            container_id,
            vm,
            agent,
            options,
            ports,
            spec: Mutex::new(spec),
            stdio: Mutex::new(Some(stdio)),
            phase: tokio::sync::Mutex::new(ProcessPhase::Configured),
            pid: AtomicI32::new(-1),
            stdin_closed: Arc::new(AtomicBool::new(false)),
            stdin_task: Mutex::new(None),
            output_tasks: Mutex::new(Vec::new()),
            tracker: Mutex::new(None),
            deletion: tokio::sync::OnceCell::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Guest pid; -1 until [`start`](Self::start) succeeds.
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn ports(&self) -> &StdioPorts {
        &self.ports
    }

    /// Amend the runtime spec. Fails once the process has started.
    pub async fn amend_spec(&self, amend: impl FnOnce(&mut Spec)) -> VesselResult<()> {
        let phase = self.phase.lock().await;
        if *phase == ProcessPhase::Started {
            return Err(VesselError::InvalidState(
                "spec is immutable after start".to_string(),
            ));
        }
        amend(&mut self.spec.lock());
        Ok(())
    }

    /// Create the process in the guest and wire its stdio.
    ///
    /// Listeners open before the agent call so the guest can dial back
    /// immediately; exactly one connection is accepted per configured
    /// stream under a shared 3 s guard, then every listener is finished.
    pub async fn create(&self) -> VesselResult<()> {
        let mut phase = self.phase.lock().await;
        if *phase != ProcessPhase::Configured {
            return Err(VesselError::InvalidState(format!(
                "cannot create process {} in phase {:?}",
                self.id, *phase
            )));
        }

        let stdio = self.stdio.lock().take().unwrap_or_default();

        let mut listeners: Vec<(StdioKind, VsockAcceptStream)> = Vec::new();
        let wanted = [
            (StdioKind::Stdin, self.ports.stdin),
            (StdioKind::Stdout, self.ports.stdout),
            (StdioKind::Stderr, self.ports.stderr),
        ];
        for (kind, port) in wanted {
            let Some(port) = port else { continue };
            match self.vm.listen(port).await {
                Ok(listener) => listeners.push((kind, listener)),
                Err(err) => {
                    finish_listeners(listeners).await;
                    return Err(err);
                }
            }
        }

        let spec = self.spec.lock().clone();
        if let Err(err) = self
            .agent
            .create_process(
                &self.id,
                self.container_id.as_deref(),
                &self.ports,
                &spec,
                &self.options,
            )
            .await
        {
            finish_listeners(listeners).await;
            return Err(err);
        }

        let accepts = listeners.iter_mut().map(|(kind, listener)| {
            let kind = *kind;
            async move {
                let conn = listener.accept().await?.ok_or_else(|| {
                    VesselError::internal("stdio listener closed before accept")
                })?;
                Ok::<(StdioKind, VsockConnection), VesselError>((kind, conn))
            }
        });
        let accepted = match with_timeout(
            "stdio accept",
            STDIO_ACCEPT_TIMEOUT,
            futures::future::try_join_all(accepts),
        )
        .await
        {
            Ok(accepted) => accepted,
            Err(err) => {
                finish_listeners(listeners).await;
                return Err(err);
            }
        };
        finish_listeners(listeners).await;

        let tracker = IoTracker::new(self.ports.output_streams());
        let mut stdio = stdio;
        for (kind, conn) in accepted {
            match kind {
                StdioKind::Stdin => {
                    let Some(reader) = stdio.stdin.take() else {
                        continue;
                    };
                    *self.stdin_task.lock() = Some(spawn_stdin_pump(
                        conn,
                        reader,
                        Arc::clone(&self.vm),
                        self.id.clone(),
                        self.container_id.clone(),
                        Arc::clone(&self.stdin_closed),
                    ));
                }
                StdioKind::Stdout => {
                    let Some(sink) = stdio.stdout.take() else {
                        continue;
                    };
                    self.output_tasks.lock().push(spawn_output_pump(
                        conn,
                        sink,
                        tracker.signaler(),
                        "stdout",
                    ));
                }
                StdioKind::Stderr => {
                    let Some(sink) = stdio.stderr.take() else {
                        continue;
                    };
                    self.output_tasks.lock().push(spawn_output_pump(
                        conn,
                        sink,
                        tracker.signaler(),
                        "stderr",
                    ));
                }
            }
        }
        *self.tracker.lock() = Some(tracker);

        *phase = ProcessPhase::Created;
        tracing::debug!(process_id = %self.id, "process created");
        Ok(())
    }

    /// Start the created process; returns its guest pid.
    pub async fn start(&self) -> VesselResult<i32> {
        let mut phase = self.phase.lock().await;
        if *phase != ProcessPhase::Created {
            return Err(VesselError::InvalidState(format!(
                "cannot start process {} in phase {:?}",
                self.id, *phase
            )));
        }

        let pid = self
            .agent
            .start_process(&self.id, self.container_id.as_deref())
            .await?;
        if pid <= 0 {
            return Err(VesselError::internal(format!(
                "agent reported nonpositive pid {pid} for process {}",
                self.id
            )));
        }

        self.pid.store(pid, Ordering::Release);
        *phase = ProcessPhase::Started;
        tracing::debug!(process_id = %self.id, pid, "process started");
        Ok(pid)
    }

    async fn ensure_started(&self) -> VesselResult<()> {
        let phase = self.phase.lock().await;
        if *phase != ProcessPhase::Started {
            return Err(VesselError::InvalidState(format!(
                "process {} is not started",
                self.id
            )));
        }
        Ok(())
    }

    pub async fn signal(&self, signal: i32) -> VesselResult<()> {
        self.ensure_started().await?;
        self.agent
            .signal_process(&self.id, self.container_id.as_deref(), signal)
            .await
    }

    /// Wait for exit, then block until stdout/stderr reach EOF or the 3 s
    /// drain window closes.
    pub async fn wait(&self, timeout: Option<Duration>) -> VesselResult<ExitStatus> {
        self.ensure_started().await?;
        let code = self
            .agent
            .wait_process(&self.id, self.container_id.as_deref(), timeout)
            .await?;

        let tracker = self.tracker.lock().clone();
        if let Some(tracker) = tracker {
            tracker.drain(IO_DRAIN_TIMEOUT).await;
        }

        Ok(ExitStatus { code })
    }

    /// Resize the process terminal.
    pub async fn resize(&self, rows: u16, cols: u16) -> VesselResult<()> {
        self.ensure_started().await?;
        if !wants_terminal(&self.spec.lock()) {
            return Err(VesselError::InvalidArgument(format!(
                "process {} has no terminal",
                self.id
            )));
        }
        self.agent
            .resize_process(&self.id, self.container_id.as_deref(), rows, cols)
            .await
    }

    /// Close the guest's stdin and cancel the relay task. The close RPC is
    /// issued at most once between this and the relay's natural EOF path.
    pub async fn close_stdin(&self) -> VesselResult<()> {
        self.ensure_started().await?;

        if self
            .stdin_closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.agent
                .close_process_stdin(&self.id, self.container_id.as_deref())
                .await?;
        }

        if let Some(task) = self.stdin_task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    /// Tear down the guest process and the host-side handles. Safe to call
    /// from any state and from any number of tasks; the agent sees exactly
    /// one deletion RPC.
    pub async fn delete(&self) -> VesselResult<()> {
        self.deletion
            .get_or_init(|| async {
                let result = self
                    .agent
                    .delete_process(&self.id, self.container_id.as_deref())
                    .await;

                // Handles close even when the agent call failed.
                if let Some(task) = self.stdin_task.lock().take() {
                    task.abort();
                }
                for task in self.output_tasks.lock().drain(..) {
                    task.abort();
                }
                if let Err(err) = self.agent.close().await {
                    tracing::debug!(error = %err, "agent channel close failed");
                }

                result
            })
            .await
            .clone()
    }
}

async fn finish_listeners(listeners: Vec<(StdioKind, VsockAcceptStream)>) {
    for (_, listener) in listeners {
        if let Err(err) = listener.finish().await {
            tracing::debug!(error = %err, "stdio listener teardown failed");
        }
    }
}
