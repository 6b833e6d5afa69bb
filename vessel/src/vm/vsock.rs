//! Vsock connection and listener handles.
//!
//! Dialing the hypervisor yields a connection object whose descriptor we
//! dup. When the dup'd descriptor is used across suspension points the
//! connection object must stay live: some hypervisors tear down the vsock
//! endpoint when the connection closes, invalidating dup'd descriptors.
//! [`VsockConnection::retained`] carries the connection as an opaque guard
//! whose release is the drop of the handle; [`VsockConnection::detached`]
//! is for descriptors safe to use on their own.

use std::any::Any;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use vessel_shared::VesselResult;

use super::backend::HypervisorBackend;

/// A dialed vsock connection: an owned descriptor plus an optional guard
/// keeping the hypervisor-side transport alive.
pub struct VsockConnection {
    fd: OwnedFd,
    guard: Option<Arc<dyn Any + Send + Sync>>,
}

impl VsockConnection {
    /// A descriptor with no backing transport object (dup-and-close).
    pub fn detached(fd: OwnedFd) -> Self {
        Self { fd, guard: None }
    }

    /// A descriptor whose transport object must outlive it (dup-and-keep).
    pub fn retained(fd: OwnedFd, guard: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            fd,
            guard: Some(guard),
        }
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    pub fn into_parts(self) -> (OwnedFd, Option<Arc<dyn Any + Send + Sync>>) {
        (self.fd, self.guard)
    }
}

impl AsRawFd for VsockConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for VsockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsockConnection")
            .field("fd", &self.fd.as_raw_fd())
            .field("retained", &self.guard.is_some())
            .finish()
    }
}

/// Duplicate a raw descriptor into an owned one.
pub(crate) fn dup_fd(raw: RawFd) -> std::io::Result<OwnedFd> {
    let duped = unsafe { libc::dup(raw) };
    if duped < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

/// Lazy queue of connections accepted on a vsock port.
///
/// Finishing the stream also tears down the hypervisor-side port mapping;
/// dropping it without [`finish`](Self::finish) leaves the port registered
/// until the VM stops.
pub struct VsockAcceptStream {
    port: u32,
    stream: Pin<Box<dyn Stream<Item = VesselResult<VsockConnection>> + Send>>,
    backend: Arc<dyn HypervisorBackend>,
    finished: bool,
}

impl VsockAcceptStream {
    pub(crate) fn new(
        port: u32,
        stream: Pin<Box<dyn Stream<Item = VesselResult<VsockConnection>> + Send>>,
        backend: Arc<dyn HypervisorBackend>,
    ) -> Self {
        Self {
            port,
            stream,
            backend,
            finished: false,
        }
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Next accepted connection; `None` once the listener is gone.
    pub async fn accept(&mut self) -> VesselResult<Option<VsockConnection>> {
        self.stream.next().await.transpose()
    }

    /// A handle that can tear down the listener independently of the
    /// stream, e.g. from a different task than the accept loop.
    pub fn closer(&self) -> VsockListenerCloser {
        VsockListenerCloser {
            backend: Arc::clone(&self.backend),
            port: self.port,
        }
    }

    /// Stop accepting and tear down the hypervisor-side listener.
    pub async fn finish(mut self) -> VesselResult<()> {
        self.finished = true;
        self.backend.close_listener(self.port).await
    }
}

impl Drop for VsockAcceptStream {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                port = self.port,
                "vsock accept stream dropped without finish"
            );
        }
    }
}

/// Detached teardown handle for a vsock listener.
#[derive(Clone)]
pub struct VsockListenerCloser {
    backend: Arc<dyn HypervisorBackend>,
    port: u32,
}

impl VsockListenerCloser {
    pub async fn close(&self) -> VesselResult<()> {
        self.backend.close_listener(self.port).await
    }
}
