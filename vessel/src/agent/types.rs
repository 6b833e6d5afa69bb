//! Value types crossing the agent channel.

use serde::{Deserialize, Serialize};

/// DNS resolver configuration, rendered into `/etc/resolv.conf`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfiguration {
    pub nameservers: Vec<String>,
    pub domain: Option<String>,
    pub search_domains: Vec<String>,
    pub options: Vec<String>,
}

impl DnsConfiguration {
    pub fn new(nameservers: Vec<String>) -> Self {
        Self {
            nameservers,
            ..Default::default()
        }
    }

    /// resolv.conf file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {ns}\n"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("domain {domain}\n"));
        }
        if !self.search_domains.is_empty() {
            out.push_str(&format!("search {}\n", self.search_domains.join(" ")));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

/// One `/etc/hosts` line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsEntry {
    pub address: String,
    pub hostnames: Vec<String>,
    pub comment: Option<String>,
}

impl HostsEntry {
    pub fn new(address: impl Into<String>, hostnames: Vec<String>) -> Self {
        Self {
            address: address.into(),
            hostnames,
            comment: None,
        }
    }
}

/// Hosts-file configuration, rendered into `/etc/hosts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsConfiguration {
    pub entries: Vec<HostsEntry>,
    pub comment: Option<String>,
}

impl HostsConfiguration {
    /// hosts file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(comment) = &self.comment {
            out.push_str(&format!("# {comment}\n"));
        }
        for entry in &self.entries {
            out.push_str(&format!("{} {}", entry.address, entry.hostnames.join(" ")));
            if let Some(comment) = &entry.comment {
                out.push_str(&format!(" # {comment}"));
            }
            out.push('\n');
        }
        out
    }
}

/// Usage counters reported per container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStatistics {
    pub container_id: String,
    pub process_count: u64,
    pub cpu_usage_usec: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: Option<u64>,
}

/// Vsock ports a process's standard streams are wired through. The guest
/// dials back on each configured port after `create_process`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StdioPorts {
    pub stdin: Option<u32>,
    pub stdout: Option<u32>,
    pub stderr: Option<u32>,
}

impl StdioPorts {
    pub fn configured(&self) -> usize {
        [self.stdin, self.stdout, self.stderr]
            .iter()
            .filter(|p| p.is_some())
            .count()
    }

    /// Number of configured output streams (stdout/stderr).
    pub fn output_streams(&self) -> u32 {
        [self.stdout, self.stderr]
            .iter()
            .filter(|p| p.is_some())
            .count() as u32
    }
}

/// Extra knobs for process creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Path of the OCI runtime binary inside the guest, when overriding the
    /// agent's default.
    pub oci_runtime_path: Option<String>,
}
