// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::traits::OverlayBackend;
use crate::hypervisor::traits::Hypervisor;
use crate::lifecycle::LifecycleError;
use crate::network::DEFAULT_MAC_PREFIX;
use crate::network_service::NetworkService;
use crate::resource::{Resource, ResourceRef};
use crate::state::traits::StateStore;
use crate::store_service::StoreService;
use crate::vm_service::VmService;

/// Knobs the operator passes down to the lifecycles.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mac_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            mac_prefix: DEFAULT_MAC_PREFIX.to_string(),
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<ResourceRef>,
    pub failed: Vec<(ResourceRef, LifecycleError)>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies ordered manifest resources one at a time.
pub struct Operator<'a> {
    stores: StoreService<'a>,
    networks: NetworkService<'a>,
    vms: VmService<'a>,
}

impl<'a> Operator<'a> {
    pub fn new(
        store: &'a dyn StateStore,
        hypervisor: Option<&'a dyn Hypervisor>,
        overlays: &'a dyn OverlayBackend,
        settings: &Settings,
    ) -> Self {
        Operator {
            stores: StoreService::new(store),
            networks: NetworkService::new(store, hypervisor),
            vms: VmService::new(store, hypervisor, overlays, &settings.mac_prefix),
        }
    }

    pub fn vms(&self) -> &VmService<'a> {
        &self.vms
    }

    /// Create every resource in the order given. A failure is logged and
    /// the batch moves on.
    pub fn create_all(&self, resources: &[Resource]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for resource in resources {
            let r = resource.reference();
            let result = match resource {
                Resource::Store(s) => self.stores.create(s).map(|_| ()),
                Resource::Network(n) => self.networks.create(n).map(|_| ()),
                Resource::VirtualMachine(v) => self.vms.create(v).map(|_| ()),
            };
            record(&mut report, r, result, "create");
        }
        report
    }

    /// Delete every resource, VMs first, so that dependents are gone before
    /// the networks and stores they use.
    pub fn delete_all(&self, resources: &[Resource]) -> ApplyReport {
        let mut ordered: Vec<&Resource> = resources.iter().collect();
        ordered.sort_by_key(|r| std::cmp::Reverse(r.kind()));

        let mut report = ApplyReport::default();
        for resource in ordered {
            let r = resource.reference();
            let meta = resource.metadata();
            let result = match resource {
                Resource::Store(_) => self.stores.delete(meta).map(|_| ()),
                Resource::Network(_) => self.networks.delete(meta).map(|_| ()),
                Resource::VirtualMachine(_) => self.vms.delete(meta).map(|_| ()),
            };
            record(&mut report, r, result, "delete");
        }
        report
    }
}

fn record(
    report: &mut ApplyReport,
    r: ResourceRef,
    result: Result<(), LifecycleError>,
    action: &str,
) {
    match result {
        Ok(()) => report.applied.push(r),
        Err(e) => {
            tracing::error!(kind = %r.kind, name = %r.name, namespace = %r.namespace, error = %e, "{action} failed");
            report.failed.push((r, e));
        }
    }
}
