//! Host-side stdio plumbing.
//!
//! Each configured stream rides its own vsock port: the host opens a
//! listener before the process is created, the guest dials back once, and
//! a pump task moves bytes between the accepted descriptor and the
//! caller's reader or writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::util::fdio;
use crate::vm::{VirtualMachineInstance, VsockConnection};

/// Caller-supplied source for process stdin.
pub type HostReader = Box<dyn AsyncRead + Send + Unpin>;
/// Caller-supplied sink for process stdout/stderr.
pub type HostWriter = Box<dyn AsyncWrite + Send + Unpin>;

const STDIO_BUFFER_SIZE: usize = 4096;

/// Standard streams a process is wired to.
#[derive(Default)]
pub struct ProcessStdio {
    pub stdin: Option<HostReader>,
    pub stdout: Option<HostWriter>,
    pub stderr: Option<HostWriter>,
}

impl ProcessStdio {
    /// No streams configured.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    pub fn with_stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    pub fn with_stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }
}

/// Counts output streams still short of EOF. `wait` drains the expected
/// number of signals before returning so callers observe complete output.
#[derive(Clone)]
pub(crate) struct IoTracker {
    sem: Arc<Semaphore>,
    expected: u32,
}

impl IoTracker {
    pub fn new(expected: u32) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(0)),
            expected,
        }
    }

    pub fn signaler(&self) -> IoSignal {
        IoSignal(Arc::clone(&self.sem))
    }

    /// Block until every configured stream reached EOF, bounded by `limit`.
    pub async fn drain(&self, limit: Duration) {
        if self.expected == 0 {
            return;
        }
        match tokio::time::timeout(limit, self.sem.acquire_many(self.expected)).await {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_closed)) => {}
            Err(_) => {
                tracing::warn!(
                    streams = self.expected,
                    "stdio drain timed out, continuing"
                );
            }
        }
    }
}

/// One EOF signal into an [`IoTracker`].
pub(crate) struct IoSignal(Arc<Semaphore>);

impl IoSignal {
    pub fn eof(self) {
        self.0.add_permits(1);
    }
}

/// Pump an accepted output stream into the caller's writer. Signals the
/// tracker at EOF or on error so `wait` never hangs on a broken stream.
pub(crate) fn spawn_output_pump(
    conn: VsockConnection,
    mut sink: HostWriter,
    signal: IoSignal,
    stream: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (fd, guard) = conn.into_parts();
        let fd = match fdio::async_fd(fd) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::warn!(stream, error = %err, "output stream registration failed");
                signal.eof();
                return;
            }
        };

        let mut buf = [0u8; STDIO_BUFFER_SIZE];
        loop {
            match fdio::read(&fd, &mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = sink.write_all(&buf[..n]).await {
                        tracing::debug!(stream, error = %err, "output sink write failed");
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(stream, error = %err, "output stream read failed");
                    break;
                }
            }
        }

        let _ = sink.flush().await;
        signal.eof();
        drop(guard);
    })
}

/// Pump the caller's reader into the accepted stdin stream.
///
/// When the reader ends naturally the guest stdin is closed too, unless
/// `close_stdin` already did it (the flag is flipped by whoever acts
/// first, so the close RPC is issued at most once). A cancelled task does
/// neither.
pub(crate) fn spawn_stdin_pump(
    conn: VsockConnection,
    mut reader: HostReader,
    vm: Arc<dyn VirtualMachineInstance>,
    process_id: String,
    container_id: Option<String>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (fd, guard) = conn.into_parts();
        let fd = match fdio::async_fd(fd) {
            Ok(fd) => fd,
            Err(err) => {
                tracing::warn!(error = %err, "stdin stream registration failed");
                return;
            }
        };

        let mut buf = [0u8; STDIO_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = fdio::write_all(&fd, &buf[..n]).await {
                        tracing::debug!(error = %err, "stdin write into guest failed");
                        drop(guard);
                        return;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "stdin reader failed");
                    break;
                }
            }
        }

        fdio::shutdown_write(fd.get_ref());

        if closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            match vm.dial_agent().await {
                Ok(agent) => {
                    if let Err(err) = agent
                        .close_process_stdin(&process_id, container_id.as_deref())
                        .await
                    {
                        tracing::debug!(error = %err, "guest stdin close failed");
                    }
                    let _ = agent.close().await;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "cannot dial agent for stdin close");
                }
            }
        }

        drop(guard);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_drains_after_all_signals() {
        let tracker = IoTracker::new(2);
        tracker.signaler().eof();
        tracker.signaler().eof();
        // Must return promptly, well inside the limit.
        tokio::time::timeout(Duration::from_secs(1), tracker.drain(Duration::from_secs(3)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tracker_times_out_on_missing_signal() {
        let tracker = IoTracker::new(1);
        let started = std::time::Instant::now();
        tracker.drain(Duration::from_millis(50)).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_tracker_with_no_streams_is_immediate() {
        let tracker = IoTracker::new(0);
        tokio::time::timeout(Duration::from_millis(10), tracker.drain(Duration::from_secs(3)))
            .await
            .unwrap();
    }
}
