//! Agent-side setup sequences shared by container and pod controllers.

use std::sync::Arc;

use vessel_shared::{VesselError, VesselResult};

use super::spec::rootfs_path;
use crate::agent::{DnsConfiguration, HostsConfiguration, VirtualMachineAgent};
use crate::mounts::ContainerMountPlan;
use crate::net::{Interface, interface_name};
use crate::process::{allocate_guest_port, allocate_host_port};
use crate::relay::{RelayDirection, RelayManager, UnixSocketConfiguration};

/// Prefix a guest-absolute destination with the container's rootfs.
pub(crate) fn in_rootfs(rootfs_dir: &str, destination: &str) -> String {
    format!("{rootfs_dir}{destination}")
}

/// Mount one workload's filesystems: the rootfs at its runtime location,
/// the regular mounts inside it, then staged file shares and their binds.
///
/// A `ro` rootfs option is stripped here; the OCI runtime in the guest
/// performs the read-only remount after setup, driven by `root.readonly`.
pub(crate) async fn mount_container_filesystems(
    agent: &dyn VirtualMachineAgent,
    plan: &ContainerMountPlan,
    container_id: &str,
) -> VesselResult<()> {
    let rootfs_dir = rootfs_path(container_id);
    agent.mkdir(&rootfs_dir, true, 0o755).await?;

    let mut rootfs = plan.rootfs.clone();
    rootfs.destination = rootfs_dir.clone();
    rootfs.options.retain(|option| option != "ro");
    agent.mount(&rootfs).await?;

    for fs in &plan.mounts {
        let mut fs = fs.clone();
        fs.destination = in_rootfs(&rootfs_dir, &fs.destination);
        agent.mkdir(&fs.destination, true, 0o755).await?;
        agent.mount(&fs).await?;
    }

    for fs in plan.holding_mounts() {
        agent.mkdir(&fs.destination, true, 0o755).await?;
        agent.mount(&fs).await?;
    }

    for fs in plan.file_binds() {
        let mut fs = fs;
        fs.destination = in_rootfs(&rootfs_dir, &fs.destination);
        agent.mount(&fs).await?;
    }

    Ok(())
}

/// Bring up every interface: address, link up, then the default route when
/// the interface carries a gateway.
pub(crate) async fn setup_networking(
    agent: &dyn VirtualMachineAgent,
    interfaces: &[Arc<dyn Interface>],
) -> VesselResult<()> {
    for (index, iface) in interfaces.iter().enumerate() {
        let name = interface_name(index);
        agent.address_add(&name, iface.address()).await?;
        agent.up(&name, iface.mtu()).await?;
        if let Some(gateway) = iface.gateway() {
            agent.route_add_default(&name, gateway).await?;
        }
    }
    Ok(())
}

/// Write resolv.conf and hosts into a workload's rootfs.
pub(crate) async fn configure_resolver(
    agent: &dyn VirtualMachineAgent,
    dns: Option<&DnsConfiguration>,
    hosts: Option<&HostsConfiguration>,
    container_id: &str,
) -> VesselResult<()> {
    let rootfs_dir = rootfs_path(container_id);
    if let Some(dns) = dns {
        agent.configure_dns(dns, &rootfs_dir).await?;
    }
    if let Some(hosts) = hosts {
        agent.configure_hosts(hosts, &rootfs_dir).await?;
    }
    Ok(())
}

/// Start the configured relays.
///
/// The guest side must listen before the host dials (`into_guest`), and
/// the host side must listen before the guest forwards (`out_of_guest`),
/// so the ordering of the two calls flips with the direction.
pub(crate) async fn start_relays(
    agent: &dyn VirtualMachineAgent,
    relays: &RelayManager,
    sockets: &[UnixSocketConfiguration],
) -> VesselResult<()> {
    if sockets.is_empty() {
        return Ok(());
    }

    let relay_agent = agent.socket_relay().ok_or_else(|| {
        VesselError::Unsupported("guest agent does not support socket relays".to_string())
    })?;

    for config in sockets {
        match config.direction {
            RelayDirection::IntoGuest => {
                let port = allocate_host_port();
                relay_agent.relay_socket(port, config).await?;
                relays.start(port, config).await?;
            }
            RelayDirection::OutOfGuest => {
                let port = allocate_guest_port();
                relays.start(port, config).await?;
                relay_agent.relay_socket(port, config).await?;
            }
        }
    }
    Ok(())
}

/// Tear down the guest side of every registered relay, best-effort.
pub(crate) async fn stop_guest_relays(
    agent: &dyn VirtualMachineAgent,
    configs: &[UnixSocketConfiguration],
) {
    let Some(relay_agent) = agent.socket_relay() else {
        return;
    };
    for config in configs {
        if let Err(err) = relay_agent.stop_socket_relay(config).await {
            tracing::warn!(relay_id = %config.id, error = %err, "guest relay stop failed");
        }
    }
}
