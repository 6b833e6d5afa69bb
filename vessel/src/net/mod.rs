//! Network interface descriptors.
//!
//! Address and CIDR arithmetic belongs to external collaborators; the
//! orchestrator only carries the values it hands to the guest agent during
//! bring-up. Interfaces are named `eth{N}` by attachment order.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A network interface attached to a VM.
pub trait Interface: Send + Sync {
    /// Guest address in CIDR notation, e.g. `192.168.64.2/24`.
    fn address(&self) -> &str;

    /// Default gateway address, when this interface carries one.
    fn gateway(&self) -> Option<&str>;

    fn mtu(&self) -> u32 {
        1500
    }

    fn mac_address(&self) -> Option<&str> {
        None
    }
}

/// Interface with statically assigned addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInterface {
    address: String,
    gateway: Option<String>,
    mtu: u32,
    mac_address: Option<String>,
}

impl StaticInterface {
    pub fn new(address: impl Into<String>, gateway: Option<String>) -> Self {
        Self {
            address: address.into(),
            gateway,
            mtu: 1500,
            mac_address: None,
        }
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_mac_address(mut self, mac: impl Into<String>) -> Self {
        self.mac_address = Some(mac.into());
        self
    }
}

impl Interface for StaticInterface {
    fn address(&self) -> &str {
        &self.address
    }

    fn gateway(&self) -> Option<&str> {
        self.gateway.as_deref()
    }

    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn mac_address(&self) -> Option<&str> {
        self.mac_address.as_deref()
    }
}

/// Flattened interface description handed to a hypervisor child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDeviceConfig {
    pub name: String,
    pub address: String,
    pub gateway: Option<String>,
    pub mtu: u32,
    pub mac_address: Option<String>,
}

impl NetworkDeviceConfig {
    pub fn from_interface(index: usize, iface: &Arc<dyn Interface>) -> Self {
        Self {
            name: interface_name(index),
            address: iface.address().to_string(),
            gateway: iface.gateway().map(str::to_string),
            mtu: iface.mtu(),
            mac_address: iface.mac_address().map(str::to_string),
        }
    }
}

/// Guest-side name of the interface at `index`.
pub fn interface_name(index: usize) -> String {
    format!("eth{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_names_follow_attachment_order() {
        assert_eq!(interface_name(0), "eth0");
        assert_eq!(interface_name(2), "eth2");
    }

    #[test]
    fn test_static_interface_defaults() {
        let iface = StaticInterface::new("10.0.0.2/24", Some("10.0.0.1".to_string()));
        assert_eq!(iface.address(), "10.0.0.2/24");
        assert_eq!(iface.gateway(), Some("10.0.0.1"));
        assert_eq!(iface.mtu(), 1500);
        assert!(iface.mac_address().is_none());
    }
}
