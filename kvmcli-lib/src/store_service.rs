// SPDX-License-Identifier: GPL-2.0-only
use crate::lifecycle::{Context, LifecycleError};
use crate::record::{NewStore, StoreRecord};
use crate::resource::{Kind, Metadata, ResourceRef};
use crate::state::traits::{StateStore, StoreTable, VmTable};
use crate::store::Store;

/// Image stores live only in the database; nothing is touched on disk.
pub struct StoreService<'a> {
    store: &'a dyn StateStore,
}

impl<'a> StoreService<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        StoreService { store }
    }

    /// Register a store and its image catalogue in one transaction.
    pub fn create(&self, spec: &Store) -> Result<StoreRecord, LifecycleError> {
        let r = ResourceRef::new(Kind::Store, &spec.metadata);
        if spec.metadata.name.trim().is_empty() {
            return Err(LifecycleError::Invalid {
                resource: r,
                reason: "name must not be empty".to_string(),
            });
        }
        if let Some((name, _)) = spec.spec.images.iter().find(|(_, i)| i.file.is_empty()) {
            return Err(LifecycleError::Invalid {
                resource: r,
                reason: format!("image '{name}' has no file"),
            });
        }

        if self
            .store
            .get_store(&spec.metadata.name, &spec.metadata.namespace)
            .step(&r, "look up record")?
            .is_some()
        {
            return Err(LifecycleError::AlreadyExists { resource: r });
        }

        let record = self
            .store
            .insert_store(&NewStore::from(spec))
            .step(&r, "insert record")?;
        tracing::info!(store = %record.name, images = record.images.len(), "store registered");
        Ok(record)
    }

    /// Remove a store. Returns `false` when it was already gone.
    ///
    /// A store still backing VMs is left in place.
    pub fn delete(&self, meta: &Metadata) -> Result<bool, LifecycleError> {
        let r = ResourceRef::new(Kind::Store, meta);
        let record = match self
            .store
            .get_store(&meta.name, &meta.namespace)
            .step(&r, "look up record")?
        {
            Some(record) => record,
            None => {
                tracing::info!(store = %meta.name, "store already deleted");
                return Ok(false);
            }
        };

        let users = self
            .store
            .vms_using_store(record.id)
            .step(&r, "check dependents")?;
        if !users.is_empty() {
            return Err(LifecycleError::InUse { resource: r, users });
        }

        let deleted = self
            .store
            .delete_store(&meta.name, &meta.namespace)
            .step(&r, "delete record")?;
        tracing::info!(store = %meta.name, "store deleted");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ForwardMode;
    use crate::record::{NewNetwork, NewVm};
    use crate::state::traits::NetworkTable;
    use crate::test_support::temp_store;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn base() -> Store {
        serde_norway::from_str(
            r#"
metadata:
  name: base
spec:
  paths:
    artifacts: /srv/artifacts
    images: /srv/images
  images:
    rocky-9:
      directory: rocky
      file: rocky-9.qcow2
"#,
        )
        .unwrap()
    }

    #[test]
    fn create_then_duplicate_is_rejected() {
        let (db, _dir) = temp_store();
        let svc = StoreService::new(&db);

        let rec = svc.create(&base()).unwrap();
        assert_eq!(rec.images.len(), 1);
        assert!(matches!(
            svc.create(&base()),
            Err(LifecycleError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn image_without_file_is_invalid() {
        let (db, _dir) = temp_store();
        let mut store = base();
        store.spec.images.get_mut("rocky-9").unwrap().file.clear();
        assert!(matches!(
            StoreService::new(&db).create(&store),
            Err(LifecycleError::Invalid { .. })
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let (db, _dir) = temp_store();
        let svc = StoreService::new(&db);
        svc.create(&base()).unwrap();

        assert!(svc.delete(&base().metadata).unwrap());
        assert!(!svc.delete(&base().metadata).unwrap());
    }

    #[test]
    fn delete_with_dependent_vm_is_rejected() {
        let (db, _dir) = temp_store();
        let svc = StoreService::new(&db);
        let store = svc.create(&base()).unwrap();
        let net = db
            .insert_network(&NewNetwork {
                name: "lab".to_string(),
                namespace: "default".to_string(),
                labels: BTreeMap::new(),
                mac_address: None,
                bridge: None,
                mode: ForwardMode::Nat,
                net_address: "192.168.100.0".parse().unwrap(),
                netmask: "255.255.255.0".parse().unwrap(),
                dhcp: None,
                autostart: false,
            })
            .unwrap();
        db.insert_vm(&NewVm {
            name: "vm-01".to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            cpu: 1,
            ram: 1024,
            mac_address: None,
            ip_address: None,
            network_id: net.id,
            store_id: store.id,
            image: "rocky-9".to_string(),
            disk_size: None,
            disk_path: PathBuf::from("/srv/images/vm-01.qcow2"),
            autostart: false,
        })
        .unwrap();

        match svc.delete(&base().metadata) {
            Err(LifecycleError::InUse { users, .. }) => assert_eq!(users, vec!["vm-01"]),
            other => panic!("expected InUse, got {other:?}"),
        }
        assert!(db.get_store("base", "default").unwrap().is_some());
    }
}
