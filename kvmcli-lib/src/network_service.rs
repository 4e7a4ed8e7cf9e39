// SPDX-License-Identifier: GPL-2.0-only
use crate::hypervisor::traits::{Hypervisor, NetworkHandle};
use crate::lifecycle::{Context, LifecycleError};
use crate::network::Network;
use crate::record::{NetworkRecord, NewNetwork};
use crate::resource::{Kind, Metadata, ResourceRef};
use crate::state::traits::{NetworkTable, StateStore, VmTable};
use crate::xml::network_xml;

/// Keeps libvirt virtual networks and their database records in step.
pub struct NetworkService<'a> {
    store: &'a dyn StateStore,
    hypervisor: Option<&'a dyn Hypervisor>,
}

impl<'a> NetworkService<'a> {
    pub fn new(store: &'a dyn StateStore, hypervisor: Option<&'a dyn Hypervisor>) -> Self {
        NetworkService { store, hypervisor }
    }

    fn hypervisor(&self, r: &ResourceRef) -> Result<&'a dyn Hypervisor, LifecycleError> {
        self.hypervisor
            .ok_or_else(|| LifecycleError::NoConnection { resource: r.clone() })
    }

    /// Record, define and start a network.
    ///
    /// 1. Validates the settings (DHCP range inside the subnet)
    /// 2. Inserts the record
    /// 3. Defines and starts the network, then sets autostart
    ///
    /// If step 3 fails the definition and the record are removed again.
    pub fn create(&self, net: &Network) -> Result<NetworkRecord, LifecycleError> {
        let r = ResourceRef::new(Kind::Network, &net.metadata);
        let hv = self.hypervisor(&r)?;

        net.validate().map_err(|reason| LifecycleError::Invalid {
            resource: r.clone(),
            reason,
        })?;

        if self
            .store
            .get_network(&net.metadata.name, &net.metadata.namespace)
            .step(&r, "look up record")?
            .is_some()
        {
            return Err(LifecycleError::AlreadyExists { resource: r });
        }
        // libvirt network names are global; never redefine one that another
        // namespace (or a hand-made definition) already uses.
        if hv
            .network_lookup_by_name(&net.metadata.name)
            .step(&r, "look up network")?
            .is_some()
        {
            return Err(LifecycleError::Invalid {
                reason: format!("libvirt already has a network named '{}'", net.metadata.name),
                resource: r,
            });
        }

        let record = self
            .store
            .insert_network(&NewNetwork::from(net))
            .step(&r, "insert record")?;

        let mut defined = None;
        if let Err(e) = self.define_and_start(hv, net, &r, &mut defined) {
            self.rollback(hv, &r, defined);
            return Err(e);
        }

        tracing::info!(network = %record.name, mode = %record.mode, "network created");
        Ok(record)
    }

    fn define_and_start(
        &self,
        hv: &dyn Hypervisor,
        net: &Network,
        r: &ResourceRef,
        defined: &mut Option<NetworkHandle>,
    ) -> Result<(), LifecycleError> {
        let xml = network_xml(net).step(r, "build network XML")?;
        tracing::debug!(network = %net.metadata.name, xml = %xml, "network definition");

        let handle = hv.network_define_xml(&xml).step(r, "define network")?;
        let handle = defined.insert(handle);
        hv.network_create(handle).step(r, "start network")?;

        if net.spec.autostart {
            if let Err(e) = hv.network_set_autostart(handle, true) {
                tracing::warn!(network = %handle.name, error = %e, "failed to set autostart");
            }
        }
        Ok(())
    }

    fn rollback(&self, hv: &dyn Hypervisor, r: &ResourceRef, defined: Option<NetworkHandle>) {
        if let Some(handle) = defined {
            match hv.network_is_active(&handle) {
                Ok(true) => {
                    if let Err(e) = hv.network_destroy(&handle) {
                        tracing::warn!(resource = %r, error = %e, "rollback: failed to stop network");
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(resource = %r, error = %e, "rollback: failed to query network"),
            }
            if let Err(e) = hv.network_undefine(&handle) {
                tracing::warn!(resource = %r, error = %e, "rollback: failed to undefine network");
            }
        }
        if let Err(e) = self.store.delete_network(&r.name, &r.namespace) {
            tracing::warn!(resource = %r, error = %e, "rollback: failed to delete record");
        }
    }

    /// Tear a network down. Returns `false` when this namespace has no such
    /// network.
    ///
    /// Only the libvirt network backing this namespace's record is touched.
    /// Refuses while VMs still reference it. A failure to delete the record
    /// after libvirt has let go of the network is only logged.
    pub fn delete(&self, meta: &Metadata) -> Result<bool, LifecycleError> {
        let r = ResourceRef::new(Kind::Network, meta);
        let hv = self.hypervisor(&r)?;

        let Some(record) = self
            .store
            .get_network(&meta.name, &meta.namespace)
            .step(&r, "look up record")?
        else {
            tracing::info!(network = %meta.name, namespace = %meta.namespace, "network already deleted");
            return Ok(false);
        };

        let users = self
            .store
            .vms_using_network(record.id)
            .step(&r, "check dependents")?;
        if !users.is_empty() {
            return Err(LifecycleError::InUse { resource: r, users });
        }

        if let Some(handle) = hv
            .network_lookup_by_name(&record.name)
            .step(&r, "look up network")?
        {
            if hv.network_is_active(&handle).step(&r, "query network")? {
                hv.network_destroy(&handle).step(&r, "stop network")?;
            }
            hv.network_undefine(&handle).step(&r, "undefine network")?;
        }

        if let Err(e) = self.store.delete_network(&meta.name, &meta.namespace) {
            tracing::error!(network = %meta.name, error = %e, "network removed but record delete failed");
        }

        tracing::info!(network = %meta.name, namespace = %meta.namespace, "network deleted");
        Ok(true)
    }
}
