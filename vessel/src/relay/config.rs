//! Relay configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which side originates connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayDirection {
    /// Host clients reach a guest service: the host listens on a unix
    /// socket, each accepted connection is dialed into the guest.
    IntoGuest,
    /// Guest clients reach a host service: the guest side forwards its
    /// unix socket through vsock, the host dials the local service.
    OutOfGuest,
}

/// One relay between a host unix socket and a guest path.
///
/// For `into_guest` the source is the host path and the destination the
/// path synthesized inside the container rootfs; for `out_of_guest` the
/// roles reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnixSocketConfiguration {
    pub id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub direction: RelayDirection,
}

impl UnixSocketConfiguration {
    pub fn into_guest(
        id: impl Into<String>,
        host_path: impl Into<PathBuf>,
        guest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            source: host_path.into(),
            destination: guest_path.into(),
            direction: RelayDirection::IntoGuest,
        }
    }

    pub fn out_of_guest(
        id: impl Into<String>,
        guest_path: impl Into<PathBuf>,
        host_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            source: guest_path.into(),
            destination: host_path.into(),
            direction: RelayDirection::OutOfGuest,
        }
    }

    /// The unix socket path on the host side.
    pub fn host_path(&self) -> &Path {
        match self.direction {
            RelayDirection::IntoGuest => &self.source,
            RelayDirection::OutOfGuest => &self.destination,
        }
    }

    /// The unix socket path inside the guest.
    pub fn guest_path(&self) -> &Path {
        match self.direction {
            RelayDirection::IntoGuest => &self.destination,
            RelayDirection::OutOfGuest => &self.source,
        }
    }
}
