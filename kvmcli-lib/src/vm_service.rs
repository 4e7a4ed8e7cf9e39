// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::traits::OverlayBackend;
use crate::hypervisor::traits::{DhcpHost, DomainHandle, DomainInfo, Hypervisor};
use crate::lifecycle::{Context, LifecycleError};
use crate::network::resolve_mac;
use crate::record::{ImageRecord, NetworkRecord, NewVm, StoreRecord, VmRecord};
use crate::resource::{Kind, Metadata, ResourceRef, DEFAULT_NAMESPACE};
use crate::state::traits::{NetworkTable, StateStore, StoreTable, VmTable};
use crate::vm::{DomainState, VirtualMachine};
use crate::xml::{domain_xml, DomainParams};
use std::path::PathBuf;

/// A side effect of VM creation that has to be reverted if a later step
/// fails.
#[derive(Debug)]
enum Undo {
    Overlay(PathBuf),
    Domain(DomainHandle),
    Running(DomainHandle),
    DhcpHost { network: String, host: DhcpHost },
}

/// Dependencies of a VM, resolved from the database.
struct Placement {
    network: NetworkRecord,
    store: StoreRecord,
    image: ImageRecord,
}

/// A recorded VM whose domain is about to be started or stopped.
struct PowerTarget<'a> {
    r: ResourceRef,
    hv: &'a dyn Hypervisor,
    domain: DomainHandle,
    state: DomainState,
}

/// Orchestrates VM lifecycles across the overlay tool, libvirt and the
/// database.
pub struct VmService<'a> {
    store: &'a dyn StateStore,
    hypervisor: Option<&'a dyn Hypervisor>,
    overlays: &'a dyn OverlayBackend,
    mac_prefix: String,
}

impl<'a> VmService<'a> {
    pub fn new(
        store: &'a dyn StateStore,
        hypervisor: Option<&'a dyn Hypervisor>,
        overlays: &'a dyn OverlayBackend,
        mac_prefix: &str,
    ) -> Self {
        VmService {
            store,
            hypervisor,
            overlays,
            mac_prefix: mac_prefix.to_string(),
        }
    }

    fn hypervisor(&self, r: &ResourceRef) -> Result<&'a dyn Hypervisor, LifecycleError> {
        self.hypervisor
            .ok_or_else(|| LifecycleError::NoConnection { resource: r.clone() })
    }

    /// Create and boot a VM.
    ///
    /// 1. Resolves the network, store and image records
    /// 2. Creates the qcow2 overlay over the base image
    /// 3. Builds the domain XML
    /// 4. Defines the domain, publishes the DHCP host, sets autostart, starts it
    /// 5. Inserts the record
    ///
    /// A failure in steps 3-5 reverts everything done since step 2.
    pub fn create(&self, vm: &VirtualMachine) -> Result<VmRecord, LifecycleError> {
        let r = ResourceRef::new(Kind::VirtualMachine, &vm.metadata);
        let hv = self.hypervisor(&r)?;

        let invalid = |reason: String| LifecycleError::Invalid {
            resource: r.clone(),
            reason,
        };
        vm.validate().map_err(invalid)?;
        let mac = resolve_mac(
            &self.mac_prefix,
            vm.spec.network.mac_address.as_deref(),
            vm.spec.network.ip,
        )
        .map_err(invalid)?;

        if self
            .store
            .get_vm(&vm.metadata.name, &vm.metadata.namespace)
            .step(&r, "look up record")?
            .is_some()
        {
            return Err(LifecycleError::AlreadyExists { resource: r.clone() });
        }
        // Domain names are global to libvirt, so a VM of the same name in
        // another namespace (or a stray definition) must not be redefined.
        if hv
            .domain_lookup_by_name(&vm.metadata.name)
            .step(&r, "look up domain")?
            .is_some()
        {
            return Err(invalid(format!(
                "libvirt already has a domain named '{}'",
                vm.metadata.name
            )));
        }

        let placement = self.place(vm, &r)?;

        let mut undo = Vec::new();
        match self.provision(hv, vm, &r, &placement, mac, &mut undo) {
            Ok(record) => {
                tracing::info!(
                    vm = %record.name,
                    network = %placement.network.name,
                    store = %placement.store.name,
                    image = %record.image,
                    "vm created"
                );
                Ok(record)
            }
            Err(e) => {
                self.rollback(hv, &r, undo);
                Err(e)
            }
        }
    }

    /// Find the records a VM depends on.
    fn place(&self, vm: &VirtualMachine, r: &ResourceRef) -> Result<Placement, LifecycleError> {
        let missing = |dependency: String| LifecycleError::DependencyNotFound {
            resource: r.clone(),
            dependency,
        };
        let ns = &vm.metadata.namespace;

        let net_name = &vm.spec.network.name;
        let network = match self.store.get_network(net_name, ns).step(r, "resolve network")? {
            Some(n) => n,
            None => self
                .store
                .get_network_by_name(net_name)
                .step(r, "resolve network")?
                .ok_or_else(|| missing(format!("network '{net_name}'")))?,
        };

        let image_name = &vm.spec.image;
        let store = match &vm.spec.store {
            Some(name) => match self.store.get_store(name, ns).step(r, "resolve store")? {
                Some(s) => s,
                None => self
                    .store
                    .get_store_by_name(name)
                    .step(r, "resolve store")?
                    .ok_or_else(|| missing(format!("store '{name}'")))?,
            },
            None => {
                let mut candidates = self
                    .store
                    .stores_with_image(image_name)
                    .step(r, "resolve store")?;
                match candidates.len() {
                    0 => return Err(missing(format!("store holding image '{image_name}'"))),
                    1 => candidates.remove(0),
                    _ => {
                        let names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();
                        return Err(LifecycleError::Invalid {
                            resource: r.clone(),
                            reason: format!(
                                "image '{image_name}' is in several stores ({}); set spec.store",
                                names.join(", ")
                            ),
                        });
                    }
                }
            }
        };

        let image = store
            .image(image_name)
            .cloned()
            .ok_or_else(|| missing(format!("image '{image_name}' in store '{}'", store.name)))?;

        Ok(Placement {
            network,
            store,
            image,
        })
    }

    fn provision(
        &self,
        hv: &dyn Hypervisor,
        vm: &VirtualMachine,
        r: &ResourceRef,
        placement: &Placement,
        mac: Option<String>,
        undo: &mut Vec<Undo>,
    ) -> Result<VmRecord, LifecycleError> {
        let base = placement.image.base_path(&placement.store);
        let disk_path = placement.store.images_path.join(vm.overlay_file_name());

        self.overlays
            .create_overlay(&base, &disk_path, vm.spec.disk.size.as_deref())
            .step(r, "create overlay")?;
        undo.push(Undo::Overlay(disk_path.clone()));

        let xml = domain_xml(&DomainParams {
            name: &vm.metadata.name,
            memory_mib: vm.spec.memory,
            vcpus: vm.spec.cpu,
            disk_path: &disk_path,
            network: &placement.network.name,
            mac_address: mac.as_deref(),
            os_profile: &placement.image.os_profile,
        })
        .step(r, "build domain XML")?;
        tracing::debug!(vm = %vm.metadata.name, xml = %xml, "domain definition");

        let domain = hv.domain_define_xml(&xml).step(r, "define domain")?;
        undo.push(Undo::Domain(domain.clone()));

        if let (Some(mac), Some(ip)) = (&mac, vm.spec.network.ip) {
            let host = DhcpHost {
                mac: mac.clone(),
                name: vm.metadata.name.clone(),
                ip,
            };
            hv.network_add_dhcp_host(&placement.network.name, &host)
                .step(r, "add DHCP host")?;
            undo.push(Undo::DhcpHost {
                network: placement.network.name.clone(),
                host,
            });
        }

        if vm.spec.autostart {
            if let Err(e) = hv.domain_set_autostart(&domain, true) {
                tracing::warn!(vm = %domain.name, error = %e, "failed to set autostart");
            }
        }

        hv.domain_create(&domain).step(r, "start domain")?;
        undo.push(Undo::Running(domain));

        self.store
            .insert_vm(&NewVm::resolved(
                vm,
                placement.network.id,
                placement.store.id,
                mac,
                disk_path,
            ))
            .step(r, "insert record")
    }

    /// Revert side effects newest first. Failures are logged and skipped.
    fn rollback(&self, hv: &dyn Hypervisor, r: &ResourceRef, undo: Vec<Undo>) {
        for action in undo.into_iter().rev() {
            tracing::debug!(resource = %r, action = ?action, "rolling back");
            let result = match &action {
                Undo::Running(domain) => hv.domain_destroy(domain).map_err(|e| e.to_string()),
                Undo::DhcpHost { network, host } => hv
                    .network_remove_dhcp_host(network, host)
                    .map_err(|e| e.to_string()),
                Undo::Domain(domain) => hv.domain_undefine(domain).map_err(|e| e.to_string()),
                Undo::Overlay(path) => self
                    .overlays
                    .delete_overlay(path)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
            };
            if let Err(e) = result {
                tracing::warn!(resource = %r, action = ?action, error = %e, "rollback step failed");
            }
        }
    }

    /// Stop and remove a VM. Returns `false` when it was already gone.
    ///
    /// Only the domain backing this namespace's record is touched. Steps run
    /// in order and the first failure stops the rest, so the record survives
    /// as evidence of an unfinished delete.
    pub fn delete(&self, meta: &Metadata) -> Result<bool, LifecycleError> {
        let r = ResourceRef::new(Kind::VirtualMachine, meta);
        let hv = self.hypervisor(&r)?;

        let Some(record) = self
            .store
            .get_vm(&meta.name, &meta.namespace)
            .step(&r, "look up record")?
        else {
            tracing::info!(vm = %meta.name, namespace = %meta.namespace, "vm already deleted");
            return Ok(false);
        };

        if let Some(domain) = hv
            .domain_lookup_by_name(&record.name)
            .step(&r, "look up domain")?
        {
            let info = hv.domain_get_info(&domain).step(&r, "query domain")?;
            if info.state.is_active() {
                hv.domain_destroy(&domain).step(&r, "stop domain")?;
            }
            hv.domain_undefine(&domain).step(&r, "undefine domain")?;
        }

        self.release_dhcp_host(hv, &record);

        if !self
            .overlays
            .delete_overlay(&record.disk_path)
            .step(&r, "delete overlay")?
        {
            tracing::debug!(path = %record.disk_path.display(), "overlay already removed");
        }

        self.store
            .delete_vm(&meta.name, &meta.namespace)
            .step(&r, "delete record")?;

        tracing::info!(vm = %meta.name, namespace = %meta.namespace, "vm deleted");
        Ok(true)
    }

    /// Best effort: the lease entry is harmless once the domain is gone.
    fn release_dhcp_host(&self, hv: &dyn Hypervisor, record: &VmRecord) {
        let (Some(mac), Some(ip)) = (&record.mac_address, record.ip_address) else {
            return;
        };
        let network = match self.store.get_network_by_id(record.network_id) {
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(vm = %record.name, error = %e, "cannot look up network for DHCP host");
                return;
            }
        };
        let host = DhcpHost {
            mac: mac.clone(),
            name: record.name.clone(),
            ip,
        };
        if let Err(e) = hv.network_remove_dhcp_host(&network.name, &host) {
            tracing::warn!(vm = %record.name, network = %network.name, error = %e, "failed to remove DHCP host");
        }
    }

    /// Boot a recorded VM. Returns `false` when it was already running.
    ///
    /// Without a namespace the name must be unique across namespaces.
    pub fn start(&self, name: &str, namespace: Option<&str>) -> Result<bool, LifecycleError> {
        let t = self.power_target(name, namespace)?;
        if t.state.is_active() {
            tracing::info!(vm = %name, state = %t.state, "vm already running");
            return Ok(false);
        }
        t.hv.domain_create(&t.domain).step(&t.r, "start domain")?;
        tracing::info!(vm = %name, namespace = %t.r.namespace, "vm started");
        Ok(true)
    }

    /// Power a recorded VM down: an ACPI request, or a hard power-off with
    /// `force`. Returns `false` when it was not running.
    pub fn stop(&self, name: &str, namespace: Option<&str>, force: bool) -> Result<bool, LifecycleError> {
        let t = self.power_target(name, namespace)?;
        if !t.state.is_active() {
            tracing::info!(vm = %name, state = %t.state, "vm not running");
            return Ok(false);
        }
        if force {
            t.hv.domain_destroy(&t.domain).step(&t.r, "stop domain")?;
        } else {
            t.hv.domain_shutdown(&t.domain).step(&t.r, "shut down domain")?;
        }
        tracing::info!(vm = %name, namespace = %t.r.namespace, force, "vm stopped");
        Ok(true)
    }

    fn power_target(&self, name: &str, namespace: Option<&str>) -> Result<PowerTarget<'a>, LifecycleError> {
        let mut r = ResourceRef {
            kind: Kind::VirtualMachine,
            name: name.to_string(),
            namespace: namespace.unwrap_or(DEFAULT_NAMESPACE).to_string(),
        };
        let hv = self.hypervisor(&r)?;

        let record = match namespace {
            Some(ns) => self.store.get_vm(name, ns),
            None => self.store.get_vm_by_name(name),
        }
        .step(&r, "look up record")?
        .ok_or_else(|| LifecycleError::NotFound { resource: r.clone() })?;
        r.namespace = record.namespace;

        let domain = hv
            .domain_lookup_by_name(name)
            .step(&r, "look up domain")?
            .ok_or_else(|| LifecycleError::DependencyNotFound {
                resource: r.clone(),
                dependency: format!("domain '{name}'"),
            })?;
        let state = hv.domain_get_info(&domain).step(&r, "query domain")?.state;
        Ok(PowerTarget {
            r,
            hv,
            domain,
            state,
        })
    }

    /// libvirt's view of a VM's domain. `None` without a connection, when
    /// libvirt does not know the domain, or when the query fails.
    pub fn info(&self, name: &str) -> Option<DomainInfo> {
        let hv = self.hypervisor?;
        let info = hv
            .domain_lookup_by_name(name)
            .and_then(|d| d.map(|d| hv.domain_get_info(&d)).transpose());
        match info {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(vm = %name, error = %e, "cannot query domain");
                None
            }
        }
    }
}
