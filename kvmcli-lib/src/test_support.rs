// SPDX-License-Identifier: GPL-2.0-only
//! In-memory stand-ins for the hypervisor and the overlay tool.
//!
//! Both fakes write to a shared [`Journal`] so tests can assert the order of
//! side effects across collaborators.

use crate::backend::traits::{OverlayBackend, OverlayError, OverlayInfo};
use crate::hypervisor::traits::{
    DhcpHost, DomainHandle, DomainInfo, Hypervisor, HypervisorError, NetworkHandle,
};
use crate::state::sqlite::SqliteStore;
use crate::vm::DomainState;
use crate::xml::definition_name;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Ordered record of side effects, e.g. `domain_destroy vm-01`.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: String) {
        self.0.lock().expect("journal lock poisoned").push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock poisoned").clone()
    }

    /// Entries starting with `prefix`, in order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().expect("journal lock poisoned").clear();
    }
}

#[derive(Debug, Clone)]
struct FakeDomain {
    uuid: String,
    xml: String,
    active: bool,
    autostart: bool,
}

#[derive(Debug, Clone)]
struct FakeNetwork {
    uuid: String,
    xml: String,
    active: bool,
    autostart: bool,
    dhcp_hosts: Vec<DhcpHost>,
}

#[derive(Default)]
struct HvState {
    domains: BTreeMap<String, FakeDomain>,
    networks: BTreeMap<String, FakeNetwork>,
    failing: HashSet<String>,
    disk_bytes: Option<u64>,
}

/// Hypervisor double. Operations can be made to fail by name with
/// [`FakeHypervisor::fail_on`].
pub struct FakeHypervisor {
    state: Mutex<HvState>,
    journal: Journal,
}

fn xml_name(xml: &str) -> Result<String, HypervisorError> {
    definition_name(xml).ok_or_else(|| HypervisorError::Parse("definition without <name>".to_string()))
}

fn failure(op: &'static str, message: &str) -> HypervisorError {
    HypervisorError::Operation {
        op,
        message: message.to_string(),
    }
}

impl FakeHypervisor {
    pub fn new(journal: Journal) -> Self {
        FakeHypervisor {
            state: Mutex::new(HvState::default()),
            journal,
        }
    }

    /// Make every later call of `op` (a trait method name such as
    /// `domain_create`) fail.
    pub fn fail_on(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn domain_exists(&self, name: &str) -> bool {
        self.lock().domains.contains_key(name)
    }

    pub fn domain_active(&self, name: &str) -> bool {
        self.lock().domains.get(name).is_some_and(|d| d.active)
    }

    pub fn domain_autostart(&self, name: &str) -> bool {
        self.lock().domains.get(name).is_some_and(|d| d.autostart)
    }

    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.lock().domains.get(name).map(|d| d.xml.clone())
    }

    pub fn network_exists(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }

    pub fn network_active(&self, name: &str) -> bool {
        self.lock().networks.get(name).is_some_and(|n| n.active)
    }

    pub fn network_xml(&self, name: &str) -> Option<String> {
        self.lock().networks.get(name).map(|n| n.xml.clone())
    }

    pub fn dhcp_hosts(&self, network: &str) -> Vec<DhcpHost> {
        self.lock()
            .networks
            .get(network)
            .map(|n| n.dhcp_hosts.clone())
            .unwrap_or_default()
    }

    /// Disk capacity every domain reports from `domain_get_info`.
    pub fn report_disk_bytes(&self, bytes: u64) {
        self.lock().disk_bytes = Some(bytes);
    }

    /// Stop a running domain behind the controller's back.
    pub fn power_off(&self, name: &str) {
        if let Some(d) = self.lock().domains.get_mut(name) {
            d.active = false;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HvState> {
        self.state.lock().expect("fake hypervisor lock poisoned")
    }

    /// Journal the call, then fail if `op` was marked failing.
    fn enter(&self, op: &'static str, subject: &str) -> Result<std::sync::MutexGuard<'_, HvState>, HypervisorError> {
        self.journal.record(format!("{op} {subject}"));
        let state = self.lock();
        if state.failing.contains(op) {
            return Err(failure(op, "injected failure"));
        }
        Ok(state)
    }
}

impl Hypervisor for FakeHypervisor {
    fn domain_define_xml(&self, xml: &str) -> Result<DomainHandle, HypervisorError> {
        let name = xml_name(xml)?;
        let mut state = self.enter("domain_define_xml", &name)?;
        let uuid = state
            .domains
            .get(&name)
            .map(|d| d.uuid.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        state.domains.insert(
            name.clone(),
            FakeDomain {
                uuid: uuid.clone(),
                xml: xml.to_string(),
                active: false,
                autostart: false,
            },
        );
        Ok(DomainHandle {
            name,
            uuid: Some(uuid),
        })
    }

    fn domain_create(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("domain_create", &domain.name)?;
        let d = state
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| failure("domain_create", "domain not found"))?;
        if d.active {
            return Err(failure("domain_create", "domain is already running"));
        }
        d.active = true;
        Ok(())
    }

    fn domain_shutdown(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("domain_shutdown", &domain.name)?;
        let d = state
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| failure("domain_shutdown", "domain not found"))?;
        if !d.active {
            return Err(failure("domain_shutdown", "domain is not running"));
        }
        // The fake guest honours ACPI at once.
        d.active = false;
        Ok(())
    }

    fn domain_destroy(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("domain_destroy", &domain.name)?;
        let d = state
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| failure("domain_destroy", "domain not found"))?;
        if !d.active {
            return Err(failure("domain_destroy", "domain is not running"));
        }
        d.active = false;
        Ok(())
    }

    fn domain_undefine(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("domain_undefine", &domain.name)?;
        state
            .domains
            .remove(&domain.name)
            .map(|_| ())
            .ok_or_else(|| failure("domain_undefine", "domain not found"))
    }

    fn domain_lookup_by_name(&self, name: &str) -> Result<Option<DomainHandle>, HypervisorError> {
        let state = self.enter("domain_lookup_by_name", name)?;
        Ok(state.domains.get(name).map(|d| DomainHandle {
            name: name.to_string(),
            uuid: Some(d.uuid.clone()),
        }))
    }

    fn domain_get_info(&self, domain: &DomainHandle) -> Result<DomainInfo, HypervisorError> {
        let state = self.enter("domain_get_info", &domain.name)?;
        let d = state
            .domains
            .get(&domain.name)
            .ok_or_else(|| failure("domain_get_info", "domain not found"))?;
        Ok(DomainInfo {
            state: if d.active {
                DomainState::Running
            } else {
                DomainState::Shutoff
            },
            max_memory_kib: 0,
            memory_kib: 0,
            vcpus: 1,
            disk_bytes: state.disk_bytes,
        })
    }

    fn domain_set_autostart(&self, domain: &DomainHandle, enabled: bool) -> Result<(), HypervisorError> {
        let mut state = self.enter("domain_set_autostart", &domain.name)?;
        let d = state
            .domains
            .get_mut(&domain.name)
            .ok_or_else(|| failure("domain_set_autostart", "domain not found"))?;
        d.autostart = enabled;
        Ok(())
    }

    fn network_define_xml(&self, xml: &str) -> Result<NetworkHandle, HypervisorError> {
        let name = xml_name(xml)?;
        let mut state = self.enter("network_define_xml", &name)?;
        let uuid = uuid::Uuid::new_v4().to_string();
        state.networks.insert(
            name.clone(),
            FakeNetwork {
                uuid: uuid.clone(),
                xml: xml.to_string(),
                active: false,
                autostart: false,
                dhcp_hosts: Vec::new(),
            },
        );
        Ok(NetworkHandle {
            name,
            uuid: Some(uuid),
        })
    }

    fn network_create(&self, network: &NetworkHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("network_create", &network.name)?;
        let n = state
            .networks
            .get_mut(&network.name)
            .ok_or_else(|| failure("network_create", "network not found"))?;
        n.active = true;
        Ok(())
    }

    fn network_destroy(&self, network: &NetworkHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("network_destroy", &network.name)?;
        let n = state
            .networks
            .get_mut(&network.name)
            .ok_or_else(|| failure("network_destroy", "network not found"))?;
        n.active = false;
        Ok(())
    }

    fn network_undefine(&self, network: &NetworkHandle) -> Result<(), HypervisorError> {
        let mut state = self.enter("network_undefine", &network.name)?;
        state
            .networks
            .remove(&network.name)
            .map(|_| ())
            .ok_or_else(|| failure("network_undefine", "network not found"))
    }

    fn network_lookup_by_name(&self, name: &str) -> Result<Option<NetworkHandle>, HypervisorError> {
        let state = self.enter("network_lookup_by_name", name)?;
        Ok(state.networks.get(name).map(|n| NetworkHandle {
            name: name.to_string(),
            uuid: Some(n.uuid.clone()),
        }))
    }

    fn network_is_active(&self, network: &NetworkHandle) -> Result<bool, HypervisorError> {
        let state = self.enter("network_is_active", &network.name)?;
        Ok(state.networks.get(&network.name).is_some_and(|n| n.active))
    }

    fn network_set_autostart(&self, network: &NetworkHandle, enabled: bool) -> Result<(), HypervisorError> {
        let mut state = self.enter("network_set_autostart", &network.name)?;
        let n = state
            .networks
            .get_mut(&network.name)
            .ok_or_else(|| failure("network_set_autostart", "network not found"))?;
        n.autostart = enabled;
        Ok(())
    }

    fn network_add_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<(), HypervisorError> {
        let mut state = self.enter("network_add_dhcp_host", &host.name)?;
        let n = state
            .networks
            .get_mut(network)
            .ok_or_else(|| failure("network_add_dhcp_host", "network not found"))?;
        if n.dhcp_hosts.iter().any(|h| h.mac == host.mac || h.ip == host.ip) {
            return Err(failure("network_add_dhcp_host", "there is an existing dhcp host entry"));
        }
        n.dhcp_hosts.push(host.clone());
        Ok(())
    }

    fn network_remove_dhcp_host(&self, network: &str, host: &DhcpHost) -> Result<(), HypervisorError> {
        let mut state = self.enter("network_remove_dhcp_host", &host.name)?;
        let n = state
            .networks
            .get_mut(network)
            .ok_or_else(|| failure("network_remove_dhcp_host", "network not found"))?;
        let before = n.dhcp_hosts.len();
        n.dhcp_hosts.retain(|h| h != host);
        if n.dhcp_hosts.len() == before {
            return Err(failure("network_remove_dhcp_host", "couldn't locate a matching dhcp host entry"));
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), HypervisorError> {
        self.journal.record("disconnect".to_string());
        Ok(())
    }
}

/// Overlay backend that tracks files in memory.
pub struct FakeOverlays {
    files: Mutex<BTreeSet<PathBuf>>,
    failing: Mutex<bool>,
    journal: Journal,
}

impl FakeOverlays {
    pub fn new(journal: Journal) -> Self {
        FakeOverlays {
            files: Mutex::new(BTreeSet::new()),
            failing: Mutex::new(false),
            journal,
        }
    }

    /// Make every later create fail as if qemu-img exited non-zero.
    pub fn fail_creates(&self, fail: bool) {
        *self.failing.lock().expect("fake overlay lock poisoned") = fail;
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("fake overlay lock poisoned").contains(path)
    }

    pub fn count(&self) -> usize {
        self.files.lock().expect("fake overlay lock poisoned").len()
    }
}

impl OverlayBackend for FakeOverlays {
    fn create_overlay(
        &self,
        base: &Path,
        dest: &Path,
        size: Option<&str>,
    ) -> Result<OverlayInfo, OverlayError> {
        self.journal.record(format!("create_overlay {}", dest.display()));
        if *self.failing.lock().expect("fake overlay lock poisoned") {
            return Err(OverlayError::Command("qemu-img exited with status 1".to_string()));
        }
        let mut files = self.files.lock().expect("fake overlay lock poisoned");
        if !files.insert(dest.to_path_buf()) {
            return Err(OverlayError::AlreadyExists(format!(
                "overlay already exists: {}",
                dest.display()
            )));
        }
        Ok(OverlayInfo {
            path: dest.to_path_buf(),
            base: base.to_path_buf(),
            size: size.map(str::to_string),
        })
    }

    fn delete_overlay(&self, path: &Path) -> Result<bool, OverlayError> {
        self.journal.record(format!("delete_overlay {}", path.display()));
        Ok(self.files.lock().expect("fake overlay lock poisoned").remove(path))
    }
}

/// A fresh SQLite state store in a temp dir. Keep the `TempDir` alive.
pub fn temp_store() -> (SqliteStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store = SqliteStore::open_and_init(&dir.path().join("kvmcli.db"))
        .expect("failed to open state store");
    (store, dir)
}
