//! Single-file share materialization.
//!
//! The hypervisor can only share directories, so a virtiofs request whose
//! source is a regular file is rewritten: the file is hardlinked (copied if
//! the link crosses filesystems) into a private temp directory, the
//! directory is shared, and after boot the agent bind-mounts the file from
//! the holding directory to its real destination.
//!
//! Shares whose original destinations sit under the same parent directory
//! are coalesced into one temp directory so a pod with many small file
//! mounts does not burn through the hypervisor's share-tag quota.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;
use vessel_shared::{VesselError, VesselResult};

use super::request::{MountKind, MountRequest};

/// Guest directory a file share is mounted under before binding.
pub const FILE_MOUNT_GUEST_ROOT: &str = "/run/file-mounts";

/// Host temp directory all file-mount staging dirs live under.
const STAGING_DIR_NAME: &str = "vessel-file-mounts";

/// One file carried by a [`FileMountShare`].
#[derive(Debug, Clone)]
pub struct FileMountBinding {
    /// Original host path of the regular file.
    pub host_path: PathBuf,
    /// Basename the hardlink carries inside the staging directory.
    pub basename: String,
    /// Real guest destination the file is bound to.
    pub destination: String,
    /// Options of the original request.
    pub options: Vec<String>,
}

/// One staged temp directory, shared into the guest as a single directory
/// share. Holds the staging directory alive; removal on drop is
/// best-effort.
#[derive(Debug)]
pub struct FileMountShare {
    temp_dir: PathBuf,
    files: Vec<FileMountBinding>,
    tag: Option<String>,
}

impl FileMountShare {
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn files(&self) -> &[FileMountBinding] {
        &self.files
    }

    /// Share tag, assigned during attachment composition.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub(crate) fn set_tag(&mut self, tag: String) {
        self.tag = Some(tag);
    }

    /// Guest path the file is reachable at once the share is mounted:
    /// `/run/file-mounts/{tag}/{basename}`.
    pub fn holding_path(&self, binding: &FileMountBinding) -> Option<String> {
        self.tag
            .as_ref()
            .map(|tag| format!("{FILE_MOUNT_GUEST_ROOT}/{tag}/{}", binding.basename))
    }
}

impl Drop for FileMountShare {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.temp_dir) {
            tracing::warn!(
                dir = %self.temp_dir.display(),
                error = %err,
                "failed to remove file-mount staging directory"
            );
        }
    }
}

/// Split `requests` into passthrough requests and staged file shares.
///
/// Directory shares, block and generic mounts pass through unchanged. A
/// virtiofs request naming a regular file is staged; naming a symlink is
/// rejected; naming an unreadable path is rejected.
pub(crate) fn extract_file_mounts(
    requests: Vec<MountRequest>,
) -> VesselResult<(Vec<MountRequest>, Vec<FileMountShare>)> {
    let mut passthrough = Vec::new();
    let mut file_requests = Vec::new();

    for request in requests {
        request.validate()?;
        if !matches!(request.kind, MountKind::Share { .. }) {
            passthrough.push(request);
            continue;
        }

        let meta = std::fs::symlink_metadata(&request.source).map_err(|err| {
            VesselError::InvalidArgument(format!(
                "unreadable mount source {}: {err}",
                request.source
            ))
        })?;

        if meta.file_type().is_symlink() {
            return Err(VesselError::InvalidArgument(format!(
                "mount source {} is a symlink",
                request.source
            )));
        }

        if meta.is_file() {
            file_requests.push(request);
        } else {
            passthrough.push(request);
        }
    }

    let shares = stage_file_mounts(file_requests)?;
    Ok((passthrough, shares))
}

/// Group file requests by their destination's parent directory, then stage
/// each group into one temp directory.
fn stage_file_mounts(requests: Vec<MountRequest>) -> VesselResult<Vec<FileMountShare>> {
    let mut groups: HashMap<PathBuf, Vec<MountRequest>> = HashMap::new();
    for request in requests {
        let parent = Path::new(&request.destination)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        groups.entry(parent).or_default().push(request);
    }

    let mut shares = Vec::new();
    for (_, mut group) in groups {
        // Basename collisions cannot share a staging dir; peel the
        // offenders off into their own singleton shares.
        let mut seen = std::collections::HashSet::new();
        let mut conflicting = Vec::new();
        group.retain(|req| {
            let name = basename_of(&req.source);
            if seen.insert(name) {
                true
            } else {
                conflicting.push(req.clone());
                false
            }
        });

        shares.push(stage_group(group)?);
        for request in conflicting {
            shares.push(stage_group(vec![request])?);
        }
    }
    Ok(shares)
}

fn stage_group(group: Vec<MountRequest>) -> VesselResult<FileMountShare> {
    let dir_name = if group.len() == 1 {
        Uuid::new_v4().to_string()
    } else {
        // Coalesced groups hash all sources together so the staging dir
        // name is stable across recomposition.
        let mut hasher = Sha256::new();
        for request in &group {
            hasher.update(request.source.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())[..32].to_string()
    };

    let temp_dir = std::env::temp_dir().join(STAGING_DIR_NAME).join(dir_name);
    std::fs::create_dir_all(&temp_dir).map_err(|err| {
        VesselError::internal_with(
            format!("failed to create staging dir {}", temp_dir.display()),
            err,
        )
    })?;

    let mut files = Vec::new();
    for request in &group {
        let basename = basename_of(&request.source);
        let staged = temp_dir.join(&basename);
        materialize(Path::new(&request.source), &staged)?;
        files.push(FileMountBinding {
            host_path: PathBuf::from(&request.source),
            basename,
            destination: request.destination.clone(),
            options: request.options.clone(),
        });
    }

    tracing::debug!(
        dir = %temp_dir.display(),
        files = files.len(),
        "staged file-mount share"
    );

    Ok(FileMountShare {
        temp_dir,
        files,
        tag: None,
    })
}

/// Hardlink the file into the staging dir, falling back to a copy when the
/// link fails (typically a cross-filesystem source).
fn materialize(source: &Path, staged: &Path) -> VesselResult<()> {
    if staged.exists() {
        return Ok(());
    }
    match std::fs::hard_link(source, staged) {
        Ok(()) => Ok(()),
        Err(link_err) => {
            tracing::debug!(
                source = %source.display(),
                error = %link_err,
                "hardlink failed, copying instead"
            );
            std::fs::copy(source, staged).map_err(|err| {
                VesselError::InvalidArgument(format!(
                    "cannot stage mount source {}: {err}",
                    source.display()
                ))
            })?;
            Ok(())
        }
    }
}

fn basename_of(source: &str) -> String {
    Path::new(source)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_regular_file_is_staged_with_matching_basename() {
        let host = tempfile::tempdir().unwrap();
        let src = write_file(host.path(), "credential", "secret");

        let request = MountRequest::share(src.to_str().unwrap(), "/etc/credential", vec![]);
        let (passthrough, shares) = extract_file_mounts(vec![request]).unwrap();

        assert!(passthrough.is_empty());
        assert_eq!(shares.len(), 1);
        let share = &shares[0];
        assert_eq!(share.files().len(), 1);
        assert_eq!(share.files()[0].basename, "credential");
        assert!(share.temp_dir().join("credential").is_file());
    }

    #[test]
    fn test_symlink_source_rejected() {
        let host = tempfile::tempdir().unwrap();
        let target = write_file(host.path(), "real", "data");
        let link = host.path().join("alias");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let request = MountRequest::share(link.to_str().unwrap(), "/etc/alias", vec![]);
        let err = extract_file_mounts(vec![request]).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_unreadable_source_rejected() {
        let request = MountRequest::share("/nonexistent/vessel-test-file", "/etc/x", vec![]);
        let err = extract_file_mounts(vec![request]).unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn test_sibling_destinations_coalesce_into_one_share() {
        let host = tempfile::tempdir().unwrap();
        let a = write_file(host.path(), "cert.pem", "a");
        let b = write_file(host.path(), "key.pem", "b");

        let requests = vec![
            MountRequest::share(a.to_str().unwrap(), "/etc/tls/cert.pem", vec![]),
            MountRequest::share(b.to_str().unwrap(), "/etc/tls/key.pem", vec![]),
        ];
        let (_, shares) = extract_file_mounts(requests).unwrap();

        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].files().len(), 2);
        assert!(shares[0].temp_dir().join("cert.pem").is_file());
        assert!(shares[0].temp_dir().join("key.pem").is_file());
    }

    #[test]
    fn test_distinct_parents_stay_separate() {
        let host = tempfile::tempdir().unwrap();
        let a = write_file(host.path(), "a", "a");
        let b = write_file(host.path(), "b", "b");

        let requests = vec![
            MountRequest::share(a.to_str().unwrap(), "/etc/a", vec![]),
            MountRequest::share(b.to_str().unwrap(), "/opt/b", vec![]),
        ];
        let (_, shares) = extract_file_mounts(requests).unwrap();
        assert_eq!(shares.len(), 2);
    }

    #[test]
    fn test_basename_collision_splits_share() {
        let host = tempfile::tempdir().unwrap();
        let dir_a = host.path().join("a");
        let dir_b = host.path().join("b");
        std::fs::create_dir_all(&dir_a).unwrap();
        std::fs::create_dir_all(&dir_b).unwrap();
        let a = write_file(&dir_a, "config", "a");
        let b = write_file(&dir_b, "config", "b");

        let requests = vec![
            MountRequest::share(a.to_str().unwrap(), "/etc/app/one-config", vec![]),
            MountRequest::share(b.to_str().unwrap(), "/etc/app/two-config", vec![]),
        ];
        let (_, shares) = extract_file_mounts(requests).unwrap();
        assert_eq!(shares.len(), 2);
    }

    #[test]
    fn test_staging_dir_removed_on_drop() {
        let host = tempfile::tempdir().unwrap();
        let src = write_file(host.path(), "data", "x");

        let request = MountRequest::share(src.to_str().unwrap(), "/etc/data", vec![]);
        let (_, shares) = extract_file_mounts(vec![request]).unwrap();
        let staged = shares[0].temp_dir().to_path_buf();
        assert!(staged.exists());
        drop(shares);
        assert!(!staged.exists());
    }

    #[test]
    fn test_directory_share_passes_through() {
        let host = tempfile::tempdir().unwrap();
        let request = MountRequest::share(host.path().to_str().unwrap(), "/data", vec![]);
        let (passthrough, shares) = extract_file_mounts(vec![request]).unwrap();
        assert_eq!(passthrough.len(), 1);
        assert!(shares.is_empty());
    }
}
