//! Vsock port allocation.
//!
//! Two process-wide counters: host-allocated ports carry host→guest
//! traffic (stdio, into-guest relays; the host listens, the guest
//! connects), guest-allocated ports carry guest→host traffic (out-of-guest
//! relays; the agent listens, the host dials).

use std::sync::atomic::{AtomicU32, Ordering};

const PORT_BASE: u32 = 0x1000_0000;

static HOST_PORTS: AtomicU32 = AtomicU32::new(PORT_BASE);
static GUEST_PORTS: AtomicU32 = AtomicU32::new(PORT_BASE);

/// Next port for the host→guest direction.
pub fn allocate_host_port() -> u32 {
    HOST_PORTS.fetch_add(1, Ordering::Relaxed)
}

/// Next port for the guest→host direction.
pub fn allocate_guest_port() -> u32 {
    GUEST_PORTS.fetch_add(1, Ordering::Relaxed)
}
