//! OCI runtime spec generation.

use std::collections::HashMap;
use std::path::PathBuf;

use oci_spec::runtime::{
    Linux, LinuxCpu, LinuxMemory, LinuxNamespace, LinuxNamespaceType, LinuxResources, Mount,
    PosixRlimitBuilder, Process, Root, Spec, User,
};
use vessel_shared::{VesselError, VesselResult};

use super::config::ProcessConfiguration;

/// CPU bandwidth period; the quota is `cpus * PERIOD`.
const CPU_PERIOD_USEC: u64 = 100_000;

/// Rootfs location of a container inside the guest.
pub fn rootfs_path(container_id: &str) -> String {
    format!("/run/container/{container_id}/rootfs")
}

/// Id (and thereby rootfs location) of a pod's pause container.
pub fn pause_container_id(pod_id: &str) -> String {
    format!("pause-{pod_id}")
}

/// Cgroup of a container, nested under its pod when there is one.
pub fn cgroup_path(container_id: &str, pod_id: Option<&str>) -> String {
    match pod_id {
        Some(pod) => format!("/container/pod/{pod}/{container_id}"),
        None => format!("/container/{container_id}"),
    }
}

fn oci_mount(
    fs_type: &str,
    source: &str,
    destination: &str,
    options: &[&str],
) -> Mount {
    let mut mount = Mount::default();
    mount.set_destination(PathBuf::from(destination));
    mount.set_typ(Some(fs_type.to_string()));
    mount.set_source(Some(PathBuf::from(source)));
    mount.set_options(Some(options.iter().map(|o| o.to_string()).collect()));
    mount
}

/// The mounts every container gets unless overridden.
pub fn default_mounts() -> Vec<Mount> {
    vec![
        oci_mount("proc", "proc", "/proc", &["nosuid", "noexec", "nodev"]),
        oci_mount("sysfs", "sysfs", "/sys", &["nosuid", "noexec", "nodev"]),
        oci_mount("devtmpfs", "none", "/dev", &["nosuid", "mode=755"]),
        oci_mount(
            "mqueue",
            "mqueue",
            "/dev/mqueue",
            &["nosuid", "noexec", "nodev"],
        ),
        oci_mount(
            "tmpfs",
            "tmpfs",
            "/dev/shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        ),
        oci_mount(
            "cgroup2",
            "none",
            "/sys/fs/cgroup",
            &["nosuid", "noexec", "nodev"],
        ),
        oci_mount(
            "devpts",
            "devpts",
            "/dev/pts",
            &["nosuid", "noexec", "gid=5", "mode=620", "ptmxmode=666"],
        ),
    ]
}

/// Inputs for [`build_runtime_spec`].
pub(crate) struct RuntimeSpecParams<'a> {
    pub container_id: &'a str,
    pub hostname: Option<&'a str>,
    pub sysctl: &'a HashMap<String, String>,
    pub process: &'a ProcessConfiguration,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub rootfs_readonly: bool,
    pub pod_id: Option<&'a str>,
    /// Join an existing PID namespace instead of creating one.
    pub pid_namespace_path: Option<String>,
}

/// Build the OCI runtime spec the guest agent hands to its runtime.
pub(crate) fn build_runtime_spec(params: RuntimeSpecParams<'_>) -> VesselResult<Spec> {
    if params.process.args.is_empty() {
        return Err(VesselError::InvalidArgument(format!(
            "container {} has no process arguments",
            params.container_id
        )));
    }

    let mut spec = Spec::default();
    spec.set_hostname(params.hostname.map(str::to_string));

    let mut root = Root::default();
    root.set_path(PathBuf::from(rootfs_path(params.container_id)));
    root.set_readonly(Some(params.rootfs_readonly));
    spec.set_root(Some(root));

    spec.set_mounts(Some(default_mounts()));

    let mut user = User::default();
    user.set_uid(params.process.user.uid);
    user.set_gid(params.process.user.gid);
    if !params.process.user.additional_gids.is_empty() {
        user.set_additional_gids(Some(params.process.user.additional_gids.clone()));
    }

    let mut process = Process::default();
    process.set_args(Some(params.process.args.clone()));
    process.set_env(Some(params.process.env.clone()));
    process.set_cwd(PathBuf::from(&params.process.cwd));
    process.set_terminal(Some(params.process.terminal));
    process.set_user(user);
    if !params.process.rlimits.is_empty() {
        let mut rlimits = Vec::with_capacity(params.process.rlimits.len());
        for rlimit in &params.process.rlimits {
            let built = PosixRlimitBuilder::default()
                .typ(rlimit.limit_type)
                .hard(rlimit.hard)
                .soft(rlimit.soft)
                .build()
                .map_err(|err| VesselError::internal_with("rlimit build failed", err))?;
            rlimits.push(built);
        }
        process.set_rlimits(Some(rlimits));
    }
    spec.set_process(Some(process));

    let mut linux = Linux::default();
    linux.set_sysctl(if params.sysctl.is_empty() {
        None
    } else {
        Some(params.sysctl.clone())
    });
    linux.set_cgroups_path(Some(PathBuf::from(cgroup_path(
        params.container_id,
        params.pod_id,
    ))));

    let mut namespaces = Vec::new();
    for ns_type in [
        LinuxNamespaceType::Cgroup,
        LinuxNamespaceType::Ipc,
        LinuxNamespaceType::Mount,
        LinuxNamespaceType::Pid,
        LinuxNamespaceType::Uts,
    ] {
        let mut ns = LinuxNamespace::default();
        ns.set_typ(ns_type);
        if ns_type == LinuxNamespaceType::Pid {
            ns.set_path(params.pid_namespace_path.clone().map(PathBuf::from));
        }
        namespaces.push(ns);
    }
    linux.set_namespaces(Some(namespaces));

    let mut cpu = LinuxCpu::default();
    cpu.set_quota(Some(params.cpus as i64 * CPU_PERIOD_USEC as i64));
    cpu.set_period(Some(CPU_PERIOD_USEC));
    let mut memory = LinuxMemory::default();
    memory.set_limit(Some(params.memory_bytes as i64));
    let mut resources = LinuxResources::default();
    resources.set_cpu(Some(cpu));
    resources.set_memory(Some(memory));
    linux.set_resources(Some(resources));

    spec.set_linux(Some(linux));
    Ok(spec)
}
