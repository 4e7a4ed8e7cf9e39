// SPDX-License-Identifier: GPL-2.0-only
use crate::resource::Metadata;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Locally administered prefix for MACs derived from a VM's IP.
pub const DEFAULT_MAC_PREFIX: &str = "02:aa:bb";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub metadata: Metadata,
    pub spec: NetworkSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(default)]
    pub mode: ForwardMode,
    pub net_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<DhcpRange>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    #[default]
    Nat,
    Route,
    Bridge,
    Open,
    /// No `<forward>` element: guests only see each other and the host.
    Isolated,
}

impl ForwardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMode::Nat => "nat",
            ForwardMode::Route => "route",
            ForwardMode::Bridge => "bridge",
            ForwardMode::Open => "open",
            ForwardMode::Isolated => "isolated",
        }
    }
}

impl std::fmt::Display for ForwardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ForwardMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nat" => Ok(ForwardMode::Nat),
            "route" => Ok(ForwardMode::Route),
            "bridge" => Ok(ForwardMode::Bridge),
            "open" => Ok(ForwardMode::Open),
            "isolated" => Ok(ForwardMode::Isolated),
            _ => Err(format!(
                "invalid forward mode: '{s}' (expected: nat, route, bridge, open, isolated)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Network {
    /// The subnet described by `netAddress`/`netmask`.
    pub fn subnet(&self) -> Result<Ipv4Network, String> {
        Ipv4Network::with_netmask(self.spec.net_address, self.spec.netmask)
            .map_err(|e| format!("invalid address/netmask: {e}"))
    }

    /// Check the settings for values libvirt would reject or misinterpret.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata.name.trim().is_empty() {
            return Err("network name must not be empty".to_string());
        }
        let subnet = self.subnet()?;
        if let Some(range) = &self.spec.dhcp {
            if !subnet.contains(range.start) || !subnet.contains(range.end) {
                return Err(format!(
                    "DHCP range {}-{} is outside {subnet}",
                    range.start, range.end
                ));
            }
            if u32::from(range.start) > u32::from(range.end) {
                return Err(format!(
                    "DHCP range start {} is after end {}",
                    range.start, range.end
                ));
            }
        }
        if let Some(mac) = &self.spec.mac_address {
            validate_mac(mac)?;
        }
        Ok(())
    }
}

/// Validate a colon-separated, six-octet MAC address.
pub fn validate_mac(mac: &str) -> Result<(), String> {
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6
        || octets
            .iter()
            .any(|o| o.len() != 2 || u8::from_str_radix(o, 16).is_err())
    {
        return Err(format!("invalid MAC address: '{mac}'"));
    }
    Ok(())
}

/// Derive a MAC from an IPv4 address: `<prefix>:00:<ip[2]>:<ip[3]>`.
pub fn mac_from_ip(prefix: &str, ip: Ipv4Addr) -> Result<String, String> {
    let parts: Vec<&str> = prefix.split(':').collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|o| o.len() != 2 || u8::from_str_radix(o, 16).is_err())
    {
        return Err(format!("invalid MAC prefix: '{prefix}' (expected three octets)"));
    }
    let o = ip.octets();
    Ok(format!(
        "{}:00:{:02x}:{:02x}",
        prefix.to_ascii_lowercase(),
        o[2],
        o[3]
    ))
}

/// Pick the MAC for an interface. An explicit MAC wins, otherwise one is
/// derived from the IP. `None` leaves the choice to libvirt.
pub fn resolve_mac(
    prefix: &str,
    explicit: Option<&str>,
    ip: Option<Ipv4Addr>,
) -> Result<Option<String>, String> {
    match (explicit, ip) {
        (Some(mac), _) => {
            validate_mac(mac)?;
            Ok(Some(mac.to_ascii_lowercase()))
        }
        (None, Some(ip)) => mac_from_ip(prefix, ip).map(Some),
        (None, None) => Ok(None),
    }
}
