// SPDX-License-Identifier: GPL-2.0-only
use crate::resource::Metadata;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub metadata: Metadata,
    pub spec: VmSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in MiB
    #[serde(default = "default_memory")]
    pub memory: u32,
    pub image: String,
    /// Store holding `image`. When omitted, the single store that carries
    /// an image of that name is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default)]
    pub disk: DiskSpec,
    pub network: NicSpec,
    #[serde(default)]
    pub autostart: bool,
}

fn default_cpu() -> u32 {
    1
}

fn default_memory() -> u32 {
    1024
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskSpec {
    /// qemu-img size string, e.g. `20G`. Defaults to the base image size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    /// Static address, published as a DHCP host entry on the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
}

impl VirtualMachine {
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata.name.trim().is_empty() {
            return Err("VM name must not be empty".to_string());
        }
        if self.spec.cpu == 0 {
            return Err("cpu must be at least 1".to_string());
        }
        if self.spec.memory == 0 {
            return Err("memory must be at least 1 MiB".to_string());
        }
        if self.spec.image.is_empty() {
            return Err("image must not be empty".to_string());
        }
        if self.spec.network.name.is_empty() {
            return Err("network name must not be empty".to_string());
        }
        Ok(())
    }

    /// File name of this VM's overlay inside the store's images directory.
    pub fn overlay_file_name(&self) -> String {
        format!("{}.qcow2", self.metadata.name)
    }
}

/// Hypervisor-reported domain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::ShuttingDown => "shutting-down",
            DomainState::Shutoff => "stopped",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
            DomainState::Unknown => "unknown",
        }
    }

    /// Whether the domain has a live qemu process that must be destroyed
    /// before it can be undefined.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running
                | DomainState::Blocked
                | DomainState::Paused
                | DomainState::ShuttingDown
                | DomainState::Suspended
        )
    }

    /// Map the state text printed by `virsh dominfo`/`domstate`.
    pub fn from_virsh(s: &str) -> Self {
        match s.trim() {
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" => DomainState::ShuttingDown,
            "shut off" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::Suspended,
            _ => DomainState::Unknown,
        }
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
