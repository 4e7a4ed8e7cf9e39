// SPDX-License-Identifier: GPL-2.0-only
use crate::vm::DomainState;
use std::net::Ipv4Addr;

/// Errors from the hypervisor gateway.
#[derive(Debug)]
pub enum HypervisorError {
    /// Could not reach the hypervisor at all
    Connect(String),
    /// The client tool could not be run
    Command(String),
    /// The hypervisor rejected an operation
    Operation { op: &'static str, message: String },
    /// Output from the hypervisor could not be understood
    Parse(String),
}

impl std::fmt::Display for HypervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HypervisorError::Connect(e) => write!(f, "cannot connect to hypervisor: {e}"),
            HypervisorError::Command(e) => write!(f, "cannot run hypervisor client: {e}"),
            HypervisorError::Operation { op, message } => write!(f, "{op} failed: {message}"),
            HypervisorError::Parse(e) => write!(f, "unexpected hypervisor output: {e}"),
        }
    }
}

impl std::error::Error for HypervisorError {}

/// A defined domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    pub name: String,
    pub uuid: Option<String>,
}

/// A defined network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub name: String,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    /// Virtual size of the root disk (`vda`), when the hypervisor reports it
    pub disk_bytes: Option<u64>,
}

/// Static DHCP lease published on a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpHost {
    pub mac: String,
    pub name: String,
    pub ip: Ipv4Addr,
}

/// The operations kvmcli needs from libvirt.
///
/// Lookups return `Ok(None)` when the object does not exist, so callers can
/// tell "already gone" apart from a failed call.
pub trait Hypervisor {
    fn domain_define_xml(&self, xml: &str) -> Result<DomainHandle, HypervisorError>;

    /// Start a defined domain.
    fn domain_create(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;

    /// Ask the guest to power down (ACPI). Returns once the request is sent.
    fn domain_shutdown(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;

    /// Hard power-off. The definition stays.
    fn domain_destroy(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;

    fn domain_undefine(&self, domain: &DomainHandle) -> Result<(), HypervisorError>;

    fn domain_lookup_by_name(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError>;

    fn domain_get_info(&self, domain: &DomainHandle) -> Result<DomainInfo, HypervisorError>;

    fn domain_set_autostart(&self, domain: &DomainHandle, enabled: bool) -> Result<(), HypervisorError>;

    fn network_define_xml(&self, xml: &str) -> Result<NetworkHandle, HypervisorError>;

    fn network_create(&self, network: &NetworkHandle) -> Result<(), HypervisorError>;

    fn network_destroy(&self, network: &NetworkHandle) -> Result<(), HypervisorError>;

    fn network_undefine(&self, network: &NetworkHandle) -> Result<(), HypervisorError>;

    fn network_lookup_by_name(&self, name: &str) -> Result<Option<NetworkHandle>, HypervisorError>;

    fn network_is_active(&self, network: &NetworkHandle) -> Result<bool, HypervisorError>;

    fn network_set_autostart(&self, network: &NetworkHandle, enabled: bool) -> Result<(), HypervisorError>;

    fn network_add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<(), HypervisorError>;

    fn network_remove_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<(), HypervisorError>;

    /// Release the connection. Further calls are undefined.
    fn disconnect(&self) -> Result<(), HypervisorError>;
}
