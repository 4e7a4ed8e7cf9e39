// SPDX-License-Identifier: GPL-2.0-only
use crate::hypervisor::traits::{
    DhcpHost, DomainHandle, DomainInfo, Hypervisor, HypervisorError, NetworkHandle,
};
use crate::vm::DomainState;
use crate::xml::{definition_name, dhcp_host_xml};
use std::io::Write;
use std::process::{Command, Output};

/// libvirt driven through the `virsh` client.
///
/// Every call runs `virsh -c <uri> ...`; there is no long-lived session, so
/// `connect` only proves the URI is reachable.
pub struct VirshHypervisor {
    binary: String,
    uri: String,
}

/// Does virsh stderr say the object does not exist?
fn is_not_found(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("failed to get domain")
        || s.contains("failed to get network")
        || s.contains("domain not found")
        || s.contains("network not found")
}

/// Extract the object name from `Domain 'vm-01' defined from /tmp/x.xml`.
/// Older virsh prints the name without quotes.
fn parse_defined_name(stdout: &str, noun: &str) -> Option<String> {
    let line = stdout.lines().find(|l| l.trim_start().starts_with(noun))?;
    let rest = line.trim_start().strip_prefix(noun)?.trim_start();
    let name = rest.split(" defined").next()?.trim();
    let name = name.trim_matches(|c| c == '\'' || c == '"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Turn `Key:   value` lines into pairs.
fn fields(text: &str) -> impl Iterator<Item = (&str, &str)> {
    text.lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
}

fn kib(value: &str) -> Result<u64, HypervisorError> {
    value
        .trim_end_matches("KiB")
        .trim()
        .parse()
        .map_err(|e| HypervisorError::Parse(format!("bad memory value '{value}': {e}")))
}

/// Parse `virsh dominfo` output.
fn parse_dominfo(text: &str) -> Result<DomainInfo, HypervisorError> {
    let mut state = None;
    let mut vcpus = None;
    let mut max_memory_kib = 0;
    let mut memory_kib = 0;

    for (key, value) in fields(text) {
        match key {
            "State" => state = Some(DomainState::from_virsh(value)),
            "CPU(s)" => {
                vcpus = Some(value.parse::<u32>().map_err(|e| {
                    HypervisorError::Parse(format!("bad CPU count '{value}': {e}"))
                })?)
            }
            "Max memory" => max_memory_kib = kib(value)?,
            "Used memory" => memory_kib = kib(value)?,
            _ => {}
        }
    }

    Ok(DomainInfo {
        state: state.ok_or_else(|| HypervisorError::Parse("dominfo without State".to_string()))?,
        vcpus: vcpus.ok_or_else(|| HypervisorError::Parse("dominfo without CPU(s)".to_string()))?,
        max_memory_kib,
        memory_kib,
        disk_bytes: None,
    })
}

/// `Capacity:` from `virsh domblkinfo`.
fn parse_capacity(text: &str) -> Option<u64> {
    fields(text)
        .find(|(k, _)| *k == "Capacity")
        .and_then(|(_, v)| v.parse().ok())
}

/// `Active:` from `virsh net-info`.
fn parse_active(text: &str) -> Result<bool, HypervisorError> {
    match fields(text).find(|(k, _)| *k == "Active").map(|(_, v)| v) {
        Some("yes") => Ok(true),
        Some("no") => Ok(false),
        other => Err(HypervisorError::Parse(format!(
            "net-info Active field: {other:?}"
        ))),
    }
}

impl VirshHypervisor {
    /// Verify the URI answers, then return a client bound to it.
    pub fn connect(binary: &str, uri: &str) -> Result<Self, HypervisorError> {
        let hv = VirshHypervisor {
            binary: binary.to_string(),
            uri: uri.to_string(),
        };
        hv.run("connect", &["uri"])
            .map_err(|e| HypervisorError::Connect(format!("{uri}: {e}")))?;
        tracing::info!(uri, "connected to hypervisor");
        Ok(hv)
    }

    fn exec(&self, args: &[&str]) -> Result<Output, HypervisorError> {
        tracing::debug!(uri = %self.uri, args = ?args, "virsh");
        Command::new(&self.binary)
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .map_err(|e| HypervisorError::Command(format!("{}: {e}", self.binary)))
    }

    /// Run a virsh subcommand and return its stdout, failing on non-zero exit.
    fn run(&self, op: &'static str, args: &[&str]) -> Result<String, HypervisorError> {
        let output = self.exec(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::Operation {
                op,
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Like `run`, but a not-found error becomes `Ok(None)`.
    fn run_lookup(&self, op: &'static str, args: &[&str]) -> Result<Option<String>, HypervisorError> {
        let output = self.exec(args)?;
        if output.status.success() {
            return Ok(Some(String::from_utf8_lossy(&output.stdout).to_string()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(HypervisorError::Operation {
            op,
            message: stderr.trim().to_string(),
        })
    }

    /// Hand an XML document to a `*-define` subcommand through a temp file.
    fn define(&self, op: &'static str, subcommand: &str, xml: &str) -> Result<String, HypervisorError> {
        let mut file = tempfile::Builder::new()
            .prefix("kvmcli-")
            .suffix(".xml")
            .tempfile()
            .map_err(|e| HypervisorError::Command(format!("cannot create temp file: {e}")))?;
        file.write_all(xml.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| HypervisorError::Command(format!("cannot write temp file: {e}")))?;
        let path = file.path().to_string_lossy().to_string();
        self.run(op, &[subcommand, &path])
    }

    /// Name of the object a `*-define` call just created. virsh output
    /// varies between releases; the definition itself is the fallback.
    fn defined_name(&self, stdout: &str, noun: &str, xml: &str) -> Result<String, HypervisorError> {
        if let Some(name) = parse_defined_name(stdout, noun) {
            return Ok(name);
        }
        let name = definition_name(xml).ok_or_else(|| {
            HypervisorError::Parse(format!("cannot tell what was defined: {}", stdout.trim()))
        })?;
        tracing::warn!(name = %name, output = %stdout.trim(), "unrecognised define output, using requested name");
        Ok(name)
    }

    fn dhcp_host(&self, op: &'static str, action: &str, network: &str, host: &DhcpHost) -> Result<(), HypervisorError> {
        let xml = dhcp_host_xml(&host.mac, &host.name, host.ip);
        self.run(
            op,
            &["net-update", network, action, "ip-dhcp-host", &xml, "--live", "--config"],
        )?;
        Ok(())
    }
}

impl Hypervisor for VirshHypervisor {
    fn domain_define_xml(&self, xml: &str) -> Result<DomainHandle, HypervisorError> {
        let stdout = self.define("define domain", "define", xml)?;
        let name = self.defined_name(&stdout, "Domain", xml)?;
        let uuid = self
            .run_lookup("domain uuid", &["domuuid", &name])?
            .map(|s| s.trim().to_string());
        Ok(DomainHandle { name, uuid })
    }

    fn domain_create(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.run("start domain", &["start", &domain.name])?;
        Ok(())
    }

    fn domain_shutdown(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.run("shut down domain", &["shutdown", &domain.name])?;
        Ok(())
    }

    fn domain_destroy(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.run("destroy domain", &["destroy", &domain.name])?;
        Ok(())
    }

    fn domain_undefine(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.run("undefine domain", &["undefine", &domain.name])?;
        Ok(())
    }

    fn domain_lookup_by_name(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError> {
        Ok(self
            .run_lookup("look up domain", &["domuuid", name])?
            .map(|uuid| DomainHandle {
                name: name.to_string(),
                uuid: Some(uuid.trim().to_string()),
            }))
    }

    fn domain_get_info(&self, domain: &DomainHandle) -> Result<DomainInfo, HypervisorError> {
        let mut info = parse_dominfo(&self.run("domain info", &["dominfo", &domain.name])?)?;
        // Disk size is informational; a domain without vda still has info.
        info.disk_bytes = self
            .run("disk info", &["domblkinfo", &domain.name, "vda"])
            .ok()
            .and_then(|out| parse_capacity(&out));
        Ok(info)
    }

    fn domain_set_autostart(&self, domain: &DomainHandle, enabled: bool) -> Result<(), HypervisorError> {
        let mut args = vec!["autostart", domain.name.as_str()];
        if !enabled {
            args.push("--disable");
        }
        self.run("set domain autostart", &args)?;
        Ok(())
    }

    fn network_define_xml(&self, xml: &str) -> Result<NetworkHandle, HypervisorError> {
        let stdout = self.define("define network", "net-define", xml)?;
        let name = self.defined_name(&stdout, "Network", xml)?;
        let uuid = self
            .run_lookup("network uuid", &["net-uuid", &name])?
            .map(|s| s.trim().to_string());
        Ok(NetworkHandle { name, uuid })
    }

    fn network_create(&self, network: &NetworkHandle) -> Result<(), HypervisorError> {
        self.run("start network", &["net-start", &network.name])?;
        Ok(())
    }

    fn network_destroy(&self, network: &NetworkHandle) -> Result<(), HypervisorError> {
        self.run("destroy network", &["net-destroy", &network.name])?;
        Ok(())
    }

    fn network_undefine(&self, network: &NetworkHandle) -> Result<(), HypervisorError> {
        self.run("undefine network", &["net-undefine", &network.name])?;
        Ok(())
    }

    fn network_lookup_by_name(&self, name: &str) -> Result<Option<NetworkHandle>, HypervisorError> {
        Ok(self
            .run_lookup("look up network", &["net-uuid", name])?
            .map(|uuid| NetworkHandle {
                name: name.to_string(),
                uuid: Some(uuid.trim().to_string()),
            }))
    }

    fn network_is_active(&self, network: &NetworkHandle) -> Result<bool, HypervisorError> {
        parse_active(&self.run("network info", &["net-info", &network.name])?)
    }

    fn network_set_autostart(&self, network: &NetworkHandle, enabled: bool) -> Result<(), HypervisorError> {
        let mut args = vec!["net-autostart", network.name.as_str()];
        if !enabled {
            args.push("--disable");
        }
        self.run("set network autostart", &args)?;
        Ok(())
    }

    fn network_add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<(), HypervisorError> {
        self.dhcp_host("add DHCP host", "add", network, host)
    }

    fn network_remove_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<(), HypervisorError> {
        self.dhcp_host("remove DHCP host", "delete", network, host)
    }

    fn disconnect(&self) -> Result<(), HypervisorError> {
        tracing::debug!(uri = %self.uri, "hypervisor connection released");
        Ok(())
    }
}
