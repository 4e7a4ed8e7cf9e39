// SPDX-License-Identifier: GPL-2.0-only
//! libvirt domain and network descriptions.
//!
//! Pure functions: a resolved spec goes in, an XML document comes out.
//! Nothing here touches the hypervisor.

use crate::network::{validate_mac, ForwardMode, Network};
use std::fmt::Write;
use std::path::Path;

const LIBOSINFO_NS: &str = "http://libosinfo.org/xmlns/libvirt/domain/1.0";
const MACHINE: &str = "pc-q35-9.2";
const EMULATOR: &str = "/usr/bin/qemu-system-x86_64";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("cannot format XML: {0}")]
    Format(#[from] std::fmt::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> BuildError {
    BuildError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Escape text for use in element content or a double-quoted attribute.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Everything needed to describe one KVM guest.
#[derive(Debug, Clone)]
pub struct DomainParams<'a> {
    pub name: &'a str,
    pub memory_mib: u32,
    pub vcpus: u32,
    pub disk_path: &'a Path,
    pub network: &'a str,
    pub mac_address: Option<&'a str>,
    /// libosinfo id, e.g. `http://rockylinux.org/rocky/9`
    pub os_profile: &'a str,
}

pub fn domain_xml(p: &DomainParams<'_>) -> Result<String, BuildError> {
    if p.name.trim().is_empty() {
        return Err(invalid("name", "must not be empty"));
    }
    if p.vcpus == 0 {
        return Err(invalid("vcpu", "must be at least 1"));
    }
    if p.memory_mib == 0 {
        return Err(invalid("memory", "must be at least 1 MiB"));
    }
    if p.network.is_empty() {
        return Err(invalid("network", "must not be empty"));
    }
    if let Some(mac) = p.mac_address {
        validate_mac(mac).map_err(|e| invalid("mac", e))?;
    }

    let mut x = String::new();
    writeln!(x, r#"<domain type="kvm">"#)?;
    writeln!(x, "  <name>{}</name>", escape(p.name))?;
    if !p.os_profile.is_empty() {
        writeln!(x, "  <metadata>")?;
        writeln!(x, r#"    <libosinfo:libosinfo xmlns:libosinfo="{LIBOSINFO_NS}">"#)?;
        writeln!(x, r#"      <libosinfo:os id="{}"/>"#, escape(p.os_profile))?;
        writeln!(x, "    </libosinfo:libosinfo>")?;
        writeln!(x, "  </metadata>")?;
    }
    writeln!(x, r#"  <memory unit="MiB">{}</memory>"#, p.memory_mib)?;
    writeln!(x, r#"  <vcpu placement="static">{}</vcpu>"#, p.vcpus)?;
    writeln!(x, "  <os>")?;
    writeln!(x, r#"    <type arch="x86_64" machine="{MACHINE}">hvm</type>"#)?;
    writeln!(x, r#"    <boot dev="hd"/>"#)?;
    writeln!(x, "  </os>")?;
    writeln!(x, "  <features>")?;
    writeln!(x, "    <acpi/>")?;
    writeln!(x, "    <apic/>")?;
    writeln!(x, r#"    <vmport state="off"/>"#)?;
    writeln!(x, "  </features>")?;
    writeln!(x, r#"  <cpu mode="host-passthrough" check="none" migratable="on"/>"#)?;
    writeln!(x, "  <devices>")?;
    writeln!(x, "    <emulator>{EMULATOR}</emulator>")?;
    writeln!(x, r#"    <controller type="pci" index="0" model="pcie-root"/>"#)?;
    writeln!(x, r#"    <controller type="usb" index="0" model="qemu-xhci"/>"#)?;
    writeln!(x, r#"    <disk type="file" device="disk">"#)?;
    writeln!(x, r#"      <driver name="qemu" type="qcow2"/>"#)?;
    writeln!(
        x,
        r#"      <source file="{}"/>"#,
        escape(&p.disk_path.to_string_lossy())
    )?;
    writeln!(x, r#"      <target dev="vda" bus="virtio"/>"#)?;
    writeln!(x, "    </disk>")?;
    writeln!(x, r#"    <interface type="network">"#)?;
    if let Some(mac) = p.mac_address {
        writeln!(x, r#"      <mac address="{}"/>"#, escape(mac))?;
    }
    writeln!(x, r#"      <source network="{}"/>"#, escape(p.network))?;
    writeln!(x, r#"      <model type="virtio"/>"#)?;
    writeln!(x, "    </interface>")?;
    writeln!(x, r#"    <channel type="spicevmc">"#)?;
    writeln!(x, r#"      <target type="virtio" name="com.redhat.spice.0"/>"#)?;
    writeln!(
        x,
        r#"      <address type="virtio-serial" controller="0" bus="0" port="2"/>"#
    )?;
    writeln!(x, "    </channel>")?;
    writeln!(x, r#"    <serial type="pty">"#)?;
    writeln!(x, r#"      <target port="0"/>"#)?;
    writeln!(x, "    </serial>")?;
    writeln!(x, r#"    <console type="pty">"#)?;
    writeln!(x, r#"      <target type="serial" port="0"/>"#)?;
    writeln!(x, "    </console>")?;
    writeln!(x, r#"    <graphics type="spice" autoport="yes">"#)?;
    writeln!(x, r#"      <listen type="address"/>"#)?;
    writeln!(x, r#"      <image compression="off"/>"#)?;
    writeln!(x, "    </graphics>")?;
    writeln!(x, "  </devices>")?;
    writeln!(x, "</domain>")?;
    Ok(x)
}

pub fn network_xml(net: &Network) -> Result<String, BuildError> {
    net.validate().map_err(|e| invalid("network", e))?;
    let spec = &net.spec;

    let mut x = String::new();
    writeln!(x, "<network>")?;
    writeln!(x, "  <name>{}</name>", escape(&net.metadata.name))?;
    if spec.mode != ForwardMode::Isolated {
        writeln!(x, r#"  <forward mode="{}"/>"#, spec.mode.as_str())?;
    }
    if let Some(bridge) = spec.bridge.as_deref().filter(|b| !b.is_empty()) {
        writeln!(x, r#"  <bridge name="{}"/>"#, escape(bridge))?;
    }
    if let Some(mac) = &spec.mac_address {
        writeln!(x, r#"  <mac address="{}"/>"#, escape(mac))?;
    }
    match &spec.dhcp {
        Some(range) => {
            writeln!(
                x,
                r#"  <ip address="{}" netmask="{}">"#,
                spec.net_address, spec.netmask
            )?;
            writeln!(x, "    <dhcp>")?;
            writeln!(x, r#"      <range start="{}" end="{}"/>"#, range.start, range.end)?;
            writeln!(x, "    </dhcp>")?;
            writeln!(x, "  </ip>")?;
        }
        None => {
            writeln!(
                x,
                r#"  <ip address="{}" netmask="{}"/>"#,
                spec.net_address, spec.netmask
            )?;
        }
    }
    writeln!(x, "</network>")?;
    Ok(x)
}

/// `<host>` element for a static DHCP lease, as passed to `net-update`.
pub fn dhcp_host_xml(mac: &str, name: &str, ip: std::net::Ipv4Addr) -> String {
    format!(
        r#"<host mac="{}" name="{}" ip="{ip}"/>"#,
        escape(mac),
        escape(name)
    )
}

/// The top-level `<name>` of a domain or network definition, unescaped.
pub fn definition_name(xml: &str) -> Option<String> {
    let start = xml.find("<name>")? + "<name>".len();
    let len = xml[start..].find("</name>")?;
    let name = xml[start..start + len]
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    if name.trim().is_empty() {
        None
    } else {
        Some(name)
    }
}
