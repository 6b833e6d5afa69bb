//! Mount request and attachment descriptors.

use serde::{Deserialize, Serialize};
use vessel_shared::{VesselError, VesselResult};

/// Read-only mount option. The only option the composer interprets.
pub const OPTION_READ_ONLY: &str = "ro";

/// How a mount request is realized on the virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountKind {
    /// Attached as a virtual block device.
    Block { extra_options: Vec<String> },
    /// Attached as a shared directory.
    Share { extra_options: Vec<String> },
    /// Passed through unchanged; the agent mounts it inside the guest.
    Generic,
}

/// An abstract mount request. Immutable once inserted into a container
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    /// Filesystem type, e.g. `ext4`, `virtiofs`, `proc`, `tmpfs`.
    pub fs_type: String,
    /// Host path or label.
    pub source: String,
    /// Absolute guest path.
    pub destination: String,
    /// Ordered mount options.
    pub options: Vec<String>,
    pub kind: MountKind,
}

impl MountRequest {
    /// Block-device request (e.g. an ext4 image).
    pub fn block(
        fs_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            fs_type: fs_type.into(),
            source: source.into(),
            destination: destination.into(),
            options,
            kind: MountKind::Block {
                extra_options: Vec::new(),
            },
        }
    }

    /// Shared-directory request (virtiofs).
    pub fn share(
        source: impl Into<String>,
        destination: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            fs_type: "virtiofs".to_string(),
            source: source.into(),
            destination: destination.into(),
            options,
            kind: MountKind::Share {
                extra_options: Vec::new(),
            },
        }
    }

    /// Guest-internal mount the agent performs directly (proc, tmpfs, ...).
    pub fn generic(
        fs_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self {
            fs_type: fs_type.into(),
            source: source.into(),
            destination: destination.into(),
            options,
            kind: MountKind::Generic,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, MountKind::Block { .. })
    }

    pub fn is_share(&self) -> bool {
        matches!(self.kind, MountKind::Share { .. })
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == OPTION_READ_ONLY)
    }

    pub fn validate(&self) -> VesselResult<()> {
        if !self.destination.starts_with('/') {
            return Err(VesselError::InvalidArgument(format!(
                "mount destination must be absolute: {}",
                self.destination
            )));
        }
        Ok(())
    }
}

/// The composer's output for one request: what the guest agent actually
/// mounts. `source` is a device path for block attachments, a share tag for
/// directory shares, or the original source for passthrough mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedFilesystem {
    pub fs_type: String,
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
    /// True when the original source was a regular file.
    pub is_file_bind: bool,
}

impl AttachedFilesystem {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == OPTION_READ_ONLY)
    }
}
