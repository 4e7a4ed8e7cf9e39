// SPDX-License-Identifier: GPL-2.0-only
//! End-to-end lifecycle scenarios: manifest in, operator over fakes, state
//! checked in the database, the fake hypervisor and the overlay set.

#[cfg(test)]
mod tests {
    use crate::backend::traits::OverlayBackend;
    use crate::hypervisor::traits::DhcpHost;
    use crate::lifecycle::LifecycleError;
    use crate::manifest;
    use crate::operator::{Operator, Settings};
    use crate::record::NewNetwork;
    use crate::resource::{Kind, Resource};
    use crate::state::sqlite::SqliteStore;
    use crate::state::traits::{NetworkTable, StoreTable, VmTable};
    use crate::test_support::{temp_store, FakeHypervisor, FakeOverlays, Journal};
    use std::path::Path;

    const LAB: &str = r#"
kind: Store
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
      osProfile: http://rockylinux.org/rocky/9
---
kind: Network
metadata:
  name: lab
spec:
  netAddress: 192.168.100.0
  netmask: 255.255.255.0
  dhcp:
    start: 192.168.100.10
    end: 192.168.100.200
---
kind: VirtualMachine
metadata:
  name: vm-01
  labels:
    role: web
spec:
  cpu: 2
  memory: 2048
  image: rocky-9
  disk:
    size: 20G
  network:
    name: lab
    ip: 192.168.100.21
  autostart: true
"#;

    const OVERLAY: &str = "/srv/images/vm-01.qcow2";

    struct Env {
        db: SqliteStore,
        _dir: tempfile::TempDir,
        journal: Journal,
        hv: FakeHypervisor,
        overlays: FakeOverlays,
        settings: Settings,
    }

    impl Env {
        fn new() -> Self {
            let (db, dir) = temp_store();
            let journal = Journal::new();
            Env {
                db,
                _dir: dir,
                hv: FakeHypervisor::new(journal.clone()),
                overlays: FakeOverlays::new(journal.clone()),
                journal,
                settings: Settings::default(),
            }
        }

        fn operator(&self) -> Operator<'_> {
            Operator::new(&self.db, Some(&self.hv), &self.overlays, &self.settings)
        }

        fn offline(&self) -> Operator<'_> {
            Operator::new(&self.db, None, &self.overlays, &self.settings)
        }
    }

    /// The VM document of `LAB`, moved to `namespace`.
    fn vm01_in(namespace: &str) -> Vec<Resource> {
        let text = LAB.split("---").last().unwrap().replace(
            "  name: vm-01\n",
            &format!("  name: vm-01\n  namespace: {namespace}\n"),
        );
        manifest::parse(&text).unwrap()
    }

    fn only(resources: &[Resource], kind: Kind) -> Vec<Resource> {
        resources.iter().filter(|r| r.kind() == kind).cloned().collect()
    }

    fn vm01_host() -> DhcpHost {
        DhcpHost {
            mac: "02:aa:bb:00:64:15".to_string(),
            name: "vm-01".to_string(),
            ip: "192.168.100.21".parse().unwrap(),
        }
    }

    #[test]
    fn full_manifest_creates_linked_rows() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();

        let report = env.operator().create_all(&resources);
        assert!(report.is_success(), "{:?}", report.failed);
        assert_eq!(report.applied.len(), 3);

        let store = env.db.get_store("base", "default").unwrap().unwrap();
        let net = env.db.get_network("lab", "default").unwrap().unwrap();
        let vm = env.db.get_vm("vm-01", "default").unwrap().unwrap();
        assert_eq!(vm.network_id, net.id);
        assert_eq!(vm.store_id, store.id);
        assert_eq!(vm.disk_path, Path::new(OVERLAY));
        assert_eq!(vm.mac_address.as_deref(), Some("02:aa:bb:00:64:15"));
        assert_eq!(vm.labels.get("role").map(String::as_str), Some("web"));

        assert!(env.overlays.exists(Path::new(OVERLAY)));
        assert!(env.hv.domain_active("vm-01"));
        assert!(env.hv.domain_autostart("vm-01"));
        assert_eq!(env.hv.dhcp_hosts("lab"), vec![vm01_host()]);

        let xml = env.hv.domain_xml("vm-01").unwrap();
        assert!(xml.contains(OVERLAY), "{xml}");
        assert!(xml.contains("http://rockylinux.org/rocky/9"), "{xml}");
    }

    #[test]
    fn creation_order_is_overlay_define_dhcp_start() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        let report = env.operator().create_all(&only(&resources, Kind::Store));
        assert!(report.is_success());
        env.operator().create_all(&only(&resources, Kind::Network));
        env.journal.clear();

        env.operator().create_all(&only(&resources, Kind::VirtualMachine));
        assert_eq!(
            env.journal.entries(),
            vec![
                "domain_lookup_by_name vm-01".to_string(),
                format!("create_overlay {OVERLAY}"),
                "domain_define_xml vm-01".to_string(),
                "network_add_dhcp_host vm-01".to_string(),
                "domain_set_autostart vm-01".to_string(),
                "domain_create vm-01".to_string(),
            ]
        );
    }

    #[test]
    fn missing_network_leaves_nothing_behind() {
        let env = Env::new();
        let text = LAB.replace("    name: lab\n    ip:", "    name: ghost\n    ip:");
        let resources = manifest::parse(&text).unwrap();

        let report = env.operator().create_all(&resources);
        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.failed.len(), 1);
        let (r, err) = &report.failed[0];
        assert_eq!(r.to_string(), "vm/vm-01");
        assert!(
            matches!(err, LifecycleError::DependencyNotFound { dependency, .. } if dependency == "network 'ghost'"),
            "{err}"
        );

        assert_eq!(env.overlays.count(), 0);
        assert!(!env.hv.domain_exists("vm-01"));
        assert!(env.db.get_vm("vm-01", "default").unwrap().is_none());
    }

    #[test]
    fn missing_image_in_store_is_dependency_error() {
        let env = Env::new();
        let text = LAB.replace("  image: rocky-9\n  disk:", "  image: alma-9\n  store: base\n  disk:");
        let resources = manifest::parse(&text);
        // The manifest itself catches a declared store lacking the image.
        assert!(resources.is_err());

        // Against a store that is only in the database the lifecycle catches it.
        let all = manifest::parse(LAB).unwrap();
        env.operator().create_all(&only(&all, Kind::Store));
        env.operator().create_all(&only(&all, Kind::Network));
        let vm_only = text.split("---").last().unwrap().to_string();
        let resources = manifest::parse(&vm_only).unwrap();
        let report = env.operator().create_all(&resources);
        assert!(matches!(
            &report.failed[0].1,
            LifecycleError::DependencyNotFound { dependency, .. } if dependency == "image 'alma-9' in store 'base'"
        ));
        assert_eq!(env.overlays.count(), 0);
    }

    #[test]
    fn insert_failure_rolls_everything_back_and_retry_succeeds() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&only(&resources, Kind::Store));
        env.operator().create_all(&only(&resources, Kind::Network));

        env.db
            .execute_raw(
                "CREATE TRIGGER vm_outage BEFORE INSERT ON vms \
                 BEGIN SELECT RAISE(ABORT, 'simulated outage'); END;",
            )
            .unwrap();

        let vms = only(&resources, Kind::VirtualMachine);
        let report = env.operator().create_all(&vms);
        assert!(matches!(
            &report.failed[0].1,
            LifecycleError::Store { step: "insert record", .. }
        ));
        assert!(!env.hv.domain_exists("vm-01"));
        assert!(!env.overlays.exists(Path::new(OVERLAY)));
        assert!(env.hv.dhcp_hosts("lab").is_empty());
        assert!(env.db.get_vm("vm-01", "default").unwrap().is_none());

        env.db.execute_raw("DROP TRIGGER vm_outage;").unwrap();
        let report = env.operator().create_all(&vms);
        assert!(report.is_success(), "{:?}", report.failed);
        assert!(env.hv.domain_active("vm-01"));
    }

    #[test]
    fn start_failure_undoes_definition_dhcp_and_overlay() {
        let env = Env::new();
        env.hv.fail_on("domain_create");
        let resources = manifest::parse(LAB).unwrap();

        let report = env.operator().create_all(&resources);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            &report.failed[0].1,
            LifecycleError::Hypervisor { step: "start domain", .. }
        ));
        assert!(!env.hv.domain_exists("vm-01"));
        assert!(env.hv.dhcp_hosts("lab").is_empty());
        assert_eq!(env.overlays.count(), 0);

        // rollback runs newest first
        let tail: Vec<String> = env.journal.entries().into_iter().rev().take(3).collect();
        assert_eq!(
            tail,
            vec![
                format!("delete_overlay {OVERLAY}"),
                "domain_undefine vm-01".to_string(),
                "network_remove_dhcp_host vm-01".to_string(),
            ]
        );
    }

    #[test]
    fn existing_overlay_is_not_overwritten() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&only(&resources, Kind::Store));
        env.operator().create_all(&only(&resources, Kind::Network));
        // Something already occupies the overlay path.
        env.overlays
            .create_overlay(Path::new("/srv/artifacts/other.qcow2"), Path::new(OVERLAY), None)
            .unwrap();

        let report = env.operator().create_all(&only(&resources, Kind::VirtualMachine));
        assert!(matches!(
            &report.failed[0].1,
            LifecycleError::Overlay { step: "create overlay", .. }
        ));
        assert!(!env.hv.domain_exists("vm-01"));
        assert!(env.overlays.exists(Path::new(OVERLAY)));
    }

    #[test]
    fn delete_runs_in_order_and_is_idempotent() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        assert!(env.operator().create_all(&resources).is_success());
        env.journal.clear();

        let report = env.operator().delete_all(&resources);
        assert!(report.is_success(), "{:?}", report.failed);
        let order: Vec<String> = report.applied.iter().map(|r| r.to_string()).collect();
        assert_eq!(order, vec!["vm/vm-01", "network/lab", "store/base"]);

        let entries = env.journal.entries();
        assert_eq!(
            entries[..6].to_vec(),
            vec![
                "domain_lookup_by_name vm-01".to_string(),
                "domain_get_info vm-01".to_string(),
                "domain_destroy vm-01".to_string(),
                "domain_undefine vm-01".to_string(),
                "network_remove_dhcp_host vm-01".to_string(),
                format!("delete_overlay {OVERLAY}"),
            ]
        );
        assert!(env.db.get_vm("vm-01", "default").unwrap().is_none());
        assert!(env.db.get_network("lab", "default").unwrap().is_none());
        assert!(env.db.get_store("base", "default").unwrap().is_none());
        assert!(!env.hv.network_exists("lab"));

        env.journal.clear();
        let report = env.operator().delete_all(&resources);
        assert!(report.is_success(), "{:?}", report.failed);
        assert!(env.journal.matching("domain_destroy").is_empty());
        assert!(env.journal.matching("delete_overlay").is_empty());
    }

    #[test]
    fn delete_of_stopped_vm_skips_destroy() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&resources);
        env.hv.power_off("vm-01");

        let report = env.operator().delete_all(&only(&resources, Kind::VirtualMachine));
        assert!(report.is_success());
        assert!(env.journal.matching("domain_destroy").is_empty());
        assert!(!env.hv.domain_exists("vm-01"));
    }

    #[test]
    fn failed_destroy_keeps_the_record() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&resources);
        env.hv.fail_on("domain_destroy");

        let report = env.operator().delete_all(&only(&resources, Kind::VirtualMachine));
        assert!(matches!(
            &report.failed[0].1,
            LifecycleError::Hypervisor { step: "stop domain", .. }
        ));
        assert!(env.db.get_vm("vm-01", "default").unwrap().is_some());
        assert!(env.overlays.exists(Path::new(OVERLAY)));
    }

    #[test]
    fn network_and_store_deletes_wait_for_vms() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&resources);

        let mut infra = only(&resources, Kind::Store);
        infra.extend(only(&resources, Kind::Network));
        let report = env.operator().delete_all(&infra);
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, LifecycleError::InUse { .. })));
        assert!(env.hv.network_active("lab"));
        assert_eq!(env.db.list_stores(None).unwrap().len(), 1);
    }

    #[test]
    fn offline_run_only_applies_stores() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();

        let report = env.offline().create_all(&resources);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, LifecycleError::NoConnection { .. })));
        assert!(env.db.list_networks(None).unwrap().is_empty());
        assert_eq!(env.overlays.count(), 0);
    }

    #[test]
    fn second_create_reports_existing_resources() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&resources);
        env.journal.clear();

        let report = env.operator().create_all(&resources);
        assert_eq!(report.failed.len(), 3);
        assert!(report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, LifecycleError::AlreadyExists { .. })));
        assert!(env.journal.entries().is_empty());
    }

    #[test]
    fn vm_without_ip_gets_no_dhcp_entry() {
        let env = Env::new();
        let text = LAB.replace("    ip: 192.168.100.21\n", "");
        let resources = manifest::parse(&text).unwrap();

        assert!(env.operator().create_all(&resources).is_success());
        assert!(env.hv.dhcp_hosts("lab").is_empty());
        let vm = env.db.get_vm("vm-01", "default").unwrap().unwrap();
        assert_eq!(vm.mac_address, None);
        assert!(env.operator().vms().info("vm-01").unwrap().state.is_active());
    }

    #[test]
    fn vm_delete_in_other_namespace_touches_nothing() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        assert!(env.operator().create_all(&resources).is_success());
        env.journal.clear();

        let report = env.operator().delete_all(&vm01_in("dev"));
        assert!(report.is_success(), "{:?}", report.failed);
        assert!(env.journal.entries().is_empty(), "{:?}", env.journal.entries());
        assert!(env.hv.domain_active("vm-01"));
        assert!(env.overlays.exists(Path::new(OVERLAY)));
        assert_eq!(env.hv.dhcp_hosts("lab"), vec![vm01_host()]);
        assert!(env.db.get_vm("vm-01", "default").unwrap().is_some());
    }

    #[test]
    fn network_delete_in_other_namespace_touches_nothing() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&only(&resources, Kind::Network));
        env.journal.clear();

        let text = "kind: Network\nmetadata:\n  name: lab\n  namespace: dev\nspec:\n  netAddress: 10.0.0.0\n  netmask: 255.255.255.0\n";
        let report = env.operator().delete_all(&manifest::parse(text).unwrap());
        assert!(report.is_success(), "{:?}", report.failed);
        assert!(env.journal.entries().is_empty(), "{:?}", env.journal.entries());
        assert!(env.hv.network_active("lab"));
        assert!(env.db.get_network("lab", "default").unwrap().is_some());
    }

    #[test]
    fn same_vm_name_in_second_namespace_is_refused() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        assert!(env.operator().create_all(&resources).is_success());
        env.journal.clear();

        let report = env.operator().create_all(&vm01_in("dev"));
        match &report.failed[..] {
            [(r, LifecycleError::Invalid { reason, .. })] => {
                assert_eq!(r.to_string(), "vm/vm-01");
                assert!(reason.contains("libvirt already has a domain"), "{reason}");
            }
            other => panic!("expected invalid, got {other:?}"),
        }
        assert_eq!(env.journal.entries(), vec!["domain_lookup_by_name vm-01".to_string()]);
        assert_eq!(env.overlays.count(), 1);
        assert!(env.db.get_vm("vm-01", "dev").unwrap().is_none());
        assert!(env.hv.domain_active("vm-01"));
    }

    #[test]
    fn vm_prefers_its_namespace_then_falls_back() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&only(&resources, Kind::Store));
        env.operator().create_all(&only(&resources, Kind::Network));

        // A second store called `base`, in dev, with its own images directory.
        let dev = r#"
kind: Store
metadata:
  name: base
  namespace: dev
spec:
  paths:
    artifacts: /srv/dev-artifacts
    images: /srv/dev-images
  images:
    rocky-9:
      directory: rocky
      file: rocky-9.qcow2
---
kind: VirtualMachine
metadata:
  name: vm-01
  namespace: dev
spec:
  image: rocky-9
  store: base
  network:
    name: lab
"#;
        let report = env.operator().create_all(&manifest::parse(dev).unwrap());
        assert!(report.is_success(), "{:?}", report.failed);

        let dev_store = env.db.get_store("base", "dev").unwrap().unwrap();
        let lab = env.db.get_network("lab", "default").unwrap().unwrap();
        let vm = env.db.get_vm("vm-01", "dev").unwrap().unwrap();
        assert_eq!(vm.store_id, dev_store.id);
        assert_eq!(vm.network_id, lab.id);
        assert_eq!(vm.disk_path, Path::new("/srv/dev-images/vm-01.qcow2"));
        assert!(env.overlays.exists(Path::new("/srv/dev-images/vm-01.qcow2")));
    }

    #[test]
    fn ambiguous_network_name_stops_the_vm_early() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        env.operator().create_all(&only(&resources, Kind::Store));
        env.operator().create_all(&only(&resources, Kind::Network));

        // libvirt refuses a second `lab`, so the dev row only exists in the database.
        let Resource::Network(mut lab) = only(&resources, Kind::Network).remove(0) else {
            panic!("expected a network");
        };
        lab.metadata.namespace = "dev".to_string();
        env.db.insert_network(&NewNetwork::from(&lab)).unwrap();
        env.journal.clear();

        let report = env.operator().create_all(&vm01_in("prod"));
        assert!(
            matches!(&report.failed[..], [(_, LifecycleError::Store { step: "resolve network", .. })]),
            "{:?}",
            report.failed
        );
        assert!(report.failed[0].1.to_string().contains("ambiguous"), "{}", report.failed[0].1);
        assert_eq!(env.journal.entries(), vec!["domain_lookup_by_name vm-01".to_string()]);
        assert_eq!(env.overlays.count(), 0);
    }

    #[test]
    fn stop_and_start_follow_the_domain_state() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        assert!(env.operator().create_all(&resources).is_success());
        let op = env.operator();
        let vms = op.vms();

        assert!(!vms.start("vm-01", None).unwrap());
        assert!(vms.stop("vm-01", None, false).unwrap());
        assert!(!env.hv.domain_active("vm-01"));
        assert!(!vms.stop("vm-01", Some("default"), false).unwrap());
        assert_eq!(env.journal.matching("domain_shutdown"), vec!["domain_shutdown vm-01"]);

        assert!(vms.start("vm-01", None).unwrap());
        assert!(env.hv.domain_active("vm-01"));
        assert!(vms.stop("vm-01", None, true).unwrap());
        assert!(!env.hv.domain_active("vm-01"));
        assert_eq!(env.journal.matching("domain_destroy"), vec!["domain_destroy vm-01"]);

        // The record, overlay and definition all survive a power cycle.
        assert!(env.hv.domain_exists("vm-01"));
        assert!(env.overlays.exists(Path::new(OVERLAY)));
        assert!(env.db.get_vm("vm-01", "default").unwrap().is_some());
    }

    #[test]
    fn power_commands_respect_namespaces() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        assert!(env.operator().create_all(&resources).is_success());

        let err = env.operator().vms().stop("vm-01", Some("dev"), false).unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound { .. }), "{err}");
        assert_eq!(err.to_string(), "vm/vm-01: not found");
        assert!(env.hv.domain_active("vm-01"));

        // A record whose domain vanished from libvirt.
        env.db.execute_raw("UPDATE vms SET name = 'vm-02'").unwrap();
        let err = env.operator().vms().start("vm-02", None).unwrap_err();
        assert!(
            matches!(&err, LifecycleError::DependencyNotFound { dependency, .. } if dependency == "domain 'vm-02'"),
            "{err}"
        );
    }

    #[test]
    fn info_reports_disk_capacity() {
        let env = Env::new();
        let resources = manifest::parse(LAB).unwrap();
        assert!(env.operator().create_all(&resources).is_success());
        env.hv.report_disk_bytes(20 * 1024 * 1024 * 1024);

        let info = env.operator().vms().info("vm-01").unwrap();
        assert!(info.state.is_active());
        assert_eq!(info.disk_bytes, Some(20 * 1024 * 1024 * 1024));
        assert!(env.operator().vms().info("vm-99").is_none());
        assert!(env.offline().vms().info("vm-01").is_none());
    }
}
