//! Mount composition.
//!
//! Turns the ordered mount requests of every workload in a VM into device
//! attachments and the descriptors the guest agent mounts after boot.

use std::collections::{HashMap, HashSet};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use vessel_shared::{VesselError, VesselResult};

use super::block::BlockTagAllocator;
use super::file_mount::{FILE_MOUNT_GUEST_ROOT, FileMountShare, extract_file_mounts};
use super::request::{AttachedFilesystem, MountKind, MountRequest};

/// Share tag the initial filesystem uses when it is a directory share. The
/// kernel mounts it by this name (`root=rootfs`).
pub const ROOT_SHARE_TAG: &str = "rootfs";

/// Content-addressed share tag for a directory: truncated SHA-256 of the
/// canonical on-disk path. Two shares with the same on-disk source always
/// produce the same tag.
pub fn share_tag(path: &Path) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let digest = Sha256::digest(canonical.as_os_str().as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Mount requests of one workload: its root filesystem plus extra mounts.
#[derive(Debug, Clone)]
pub struct WorkloadMounts {
    pub id: String,
    pub rootfs: MountRequest,
    pub mounts: Vec<MountRequest>,
}

/// A block device handed to the hypervisor, in allocation order.
#[derive(Debug, Clone)]
pub struct BlockDeviceAttachment {
    pub host_path: PathBuf,
    pub device_path: String,
    pub read_only: bool,
}

/// A shared directory handed to the hypervisor.
#[derive(Debug, Clone)]
pub struct DirectoryShareAttachment {
    pub host_path: PathBuf,
    pub tag: String,
    pub read_only: bool,
}

/// Everything the agent mounts for one workload.
#[derive(Debug)]
pub struct ContainerMountPlan {
    pub id: String,
    /// Root filesystem attachment; its `destination` is still the request's
    /// destination, the controller mounts it at the workload's rootfs path.
    pub rootfs: AttachedFilesystem,
    /// Attachments mounted inside the rootfs, in request order.
    pub mounts: Vec<AttachedFilesystem>,
    /// Staged single-file shares, tags assigned. Keeps temp dirs alive.
    pub file_shares: Vec<FileMountShare>,
}

impl ContainerMountPlan {
    /// All attachments for this workload, file binds excluded: the rootfs,
    /// the regular mounts, and one holding mount per staged share.
    pub fn attachments(&self) -> Vec<AttachedFilesystem> {
        let mut out = Vec::with_capacity(1 + self.mounts.len() + self.file_shares.len());
        out.push(self.rootfs.clone());
        out.extend(self.mounts.iter().cloned());
        out.extend(self.holding_mounts());
        out
    }

    /// Mounts of the staged shares at `/run/file-mounts/{tag}`.
    pub fn holding_mounts(&self) -> Vec<AttachedFilesystem> {
        self.file_shares
            .iter()
            .filter_map(|share| {
                share.tag().map(|tag| AttachedFilesystem {
                    fs_type: "virtiofs".to_string(),
                    source: tag.to_string(),
                    destination: format!("{FILE_MOUNT_GUEST_ROOT}/{tag}"),
                    options: Vec::new(),
                    is_file_bind: true,
                })
            })
            .collect()
    }

    /// Bind mounts from the holding directories to the real destinations,
    /// to be performed after the holding mounts.
    pub fn file_binds(&self) -> Vec<AttachedFilesystem> {
        let mut out = Vec::new();
        for share in &self.file_shares {
            for file in share.files() {
                let Some(holding) = share.holding_path(file) else {
                    continue;
                };
                let mut options = vec!["bind".to_string()];
                options.extend(file.options.iter().cloned());
                out.push(AttachedFilesystem {
                    fs_type: "bind".to_string(),
                    source: holding,
                    destination: file.destination.clone(),
                    options,
                    is_file_bind: true,
                });
            }
        }
        out
    }
}

/// Output of [`MountComposer::compose`].
#[derive(Debug)]
pub struct ComposedMounts {
    pub containers: Vec<ContainerMountPlan>,
    pub block_devices: Vec<BlockDeviceAttachment>,
    pub directory_shares: Vec<DirectoryShareAttachment>,
    /// The first workload's root filesystem request; decides the kernel
    /// command line.
    pub initial_filesystem: MountRequest,
}

impl ComposedMounts {
    pub fn container(&self, id: &str) -> Option<&ContainerMountPlan> {
        self.containers.iter().find(|c| c.id == id)
    }
}

/// Composes workload mount requests into hypervisor attachments.
///
/// The first workload's rootfs is the VM's initial filesystem: a block
/// rootfs takes `/dev/vda`, a shared rootfs takes the fixed `rootfs` tag.
#[derive(Default)]
pub struct MountComposer {
    allocator: BlockTagAllocator,
    tags_by_source: HashMap<PathBuf, String>,
    seen_tags: HashSet<String>,
    block_devices: Vec<BlockDeviceAttachment>,
    directory_shares: Vec<DirectoryShareAttachment>,
}

impl MountComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compose(mut self, workloads: Vec<WorkloadMounts>) -> VesselResult<ComposedMounts> {
        if workloads.is_empty() {
            return Err(VesselError::InvalidArgument(
                "at least one workload is required".to_string(),
            ));
        }
        let initial_filesystem = workloads[0].rootfs.clone();

        let mut containers = Vec::with_capacity(workloads.len());
        for (index, workload) in workloads.into_iter().enumerate() {
            workload.rootfs.validate()?;

            let rootfs = if index == 0 && workload.rootfs.is_share() {
                self.attach_share_fixed_tag(&workload.rootfs, ROOT_SHARE_TAG)?
            } else {
                self.attach(&workload.rootfs)?
            };

            let (passthrough, mut file_shares) = extract_file_mounts(workload.mounts)?;

            let mut mounts = Vec::with_capacity(passthrough.len());
            for request in &passthrough {
                mounts.push(self.attach(request)?);
            }

            for share in &mut file_shares {
                let tag = self.register_share(share.temp_dir(), false)?;
                share.set_tag(tag);
            }

            containers.push(ContainerMountPlan {
                id: workload.id,
                rootfs,
                mounts,
                file_shares,
            });
        }

        Ok(ComposedMounts {
            containers,
            block_devices: self.block_devices,
            directory_shares: self.directory_shares,
            initial_filesystem,
        })
    }

    fn attach(&mut self, request: &MountRequest) -> VesselResult<AttachedFilesystem> {
        request.validate()?;
        match &request.kind {
            MountKind::Block { .. } => {
                let letter = self.allocator.allocate()?;
                let device_path = BlockTagAllocator::device_path(letter);
                self.block_devices.push(BlockDeviceAttachment {
                    host_path: PathBuf::from(&request.source),
                    device_path: device_path.clone(),
                    read_only: request.is_read_only(),
                });
                Ok(AttachedFilesystem {
                    fs_type: request.fs_type.clone(),
                    source: device_path,
                    destination: request.destination.clone(),
                    options: request.options.clone(),
                    is_file_bind: false,
                })
            }
            MountKind::Share { .. } => {
                let tag = self.register_share(Path::new(&request.source), request.is_read_only())?;
                Ok(AttachedFilesystem {
                    fs_type: request.fs_type.clone(),
                    source: tag,
                    destination: request.destination.clone(),
                    options: request.options.clone(),
                    is_file_bind: false,
                })
            }
            MountKind::Generic => Ok(AttachedFilesystem {
                fs_type: request.fs_type.clone(),
                source: request.source.clone(),
                destination: request.destination.clone(),
                options: request.options.clone(),
                is_file_bind: false,
            }),
        }
    }

    fn attach_share_fixed_tag(
        &mut self,
        request: &MountRequest,
        tag: &str,
    ) -> VesselResult<AttachedFilesystem> {
        self.record_tag(tag)?;
        self.tags_by_source
            .insert(canonical(Path::new(&request.source)), tag.to_string());
        self.directory_shares.push(DirectoryShareAttachment {
            host_path: PathBuf::from(&request.source),
            tag: tag.to_string(),
            read_only: request.is_read_only(),
        });
        Ok(AttachedFilesystem {
            fs_type: request.fs_type.clone(),
            source: tag.to_string(),
            destination: request.destination.clone(),
            options: request.options.clone(),
            is_file_bind: false,
        })
    }

    /// Allocate (or reuse) the share tag for a directory. Duplicate sources
    /// collapse onto the existing share; the hypervisor mandates tag
    /// uniqueness per VM.
    fn register_share(&mut self, source: &Path, read_only: bool) -> VesselResult<String> {
        let key = canonical(source);
        if let Some(existing) = self.tags_by_source.get(&key) {
            return Ok(existing.clone());
        }

        let tag = share_tag(source);
        self.record_tag(&tag)?;
        self.tags_by_source.insert(key, tag.clone());
        self.directory_shares.push(DirectoryShareAttachment {
            host_path: source.to_path_buf(),
            tag: tag.clone(),
            read_only,
        });
        Ok(tag)
    }

    fn record_tag(&mut self, tag: &str) -> VesselResult<()> {
        if !self.seen_tags.insert(tag.to_string()) {
            return Err(VesselError::internal(format!(
                "share tag collision: {tag}"
            )));
        }
        Ok(())
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
