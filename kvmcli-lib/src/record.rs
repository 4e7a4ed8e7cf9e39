// SPDX-License-Identifier: GPL-2.0-only
//! Persistence-layer shapes for each resource kind and the conversions
//! between them and decoded manifest resources.
//!
//! `New*` structs are insert parameters; the plain record structs are what
//! the state store returns, with surrogate ids and `created_at` filled in.

use crate::network::{DhcpRange, ForwardMode, Network, NetworkSpec};
use crate::resource::Metadata;
use crate::store::{ImageSpec, Store, StorePaths, StoreSpec};
use crate::vm::{DiskSpec, NicSpec, VirtualMachine, VmSpec};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct NewStore {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub backend: String,
    pub artifacts_path: PathBuf,
    pub images_path: PathBuf,
    pub images: Vec<NewImage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    pub name: String,
    pub version: String,
    pub os_profile: String,
    pub directory: String,
    pub file: String,
    pub checksum: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub backend: String,
    pub artifacts_path: PathBuf,
    pub images_path: PathBuf,
    pub images: Vec<ImageRecord>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: i64,
    pub store_id: i64,
    pub name: String,
    pub version: String,
    pub os_profile: String,
    pub directory: String,
    pub file: String,
    pub checksum: String,
    pub size: String,
    pub created_at: i64,
}

impl ImageRecord {
    /// Absolute path of the base image inside the owning store.
    pub fn base_path(&self, store: &StoreRecord) -> PathBuf {
        store.artifacts_path.join(&self.directory).join(&self.file)
    }
}

impl StoreRecord {
    pub fn image(&self, name: &str) -> Option<&ImageRecord> {
        self.images.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNetwork {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub mac_address: Option<String>,
    pub bridge: Option<String>,
    pub mode: ForwardMode,
    pub net_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: Option<DhcpRange>,
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub mac_address: Option<String>,
    pub bridge: Option<String>,
    pub mode: ForwardMode,
    pub net_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp: Option<DhcpRange>,
    pub autostart: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewVm {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub cpu: u32,
    pub ram: u32,
    pub mac_address: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    pub network_id: i64,
    pub store_id: i64,
    pub image: String,
    pub disk_size: Option<String>,
    pub disk_path: PathBuf,
    pub autostart: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmRecord {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub cpu: u32,
    pub ram: u32,
    pub mac_address: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    pub network_id: i64,
    pub store_id: i64,
    pub image: String,
    pub disk_size: Option<String>,
    pub disk_path: PathBuf,
    pub autostart: bool,
    pub created_at: i64,
}

impl From<&Store> for NewStore {
    fn from(store: &Store) -> Self {
        NewStore {
            name: store.metadata.name.clone(),
            namespace: store.metadata.namespace.clone(),
            labels: store.metadata.labels.clone(),
            backend: store.spec.backend.clone(),
            artifacts_path: store.spec.paths.artifacts.clone(),
            images_path: store.spec.paths.images.clone(),
            images: store
                .spec
                .images
                .iter()
                .map(|(name, spec)| NewImage {
                    name: name.clone(),
                    version: spec.version.clone(),
                    os_profile: spec.os_profile.clone(),
                    directory: spec.directory.clone(),
                    file: spec.file.clone(),
                    checksum: spec.checksum.clone(),
                    size: spec.size.clone(),
                })
                .collect(),
        }
    }
}

impl From<&Network> for NewNetwork {
    fn from(net: &Network) -> Self {
        NewNetwork {
            name: net.metadata.name.clone(),
            namespace: net.metadata.namespace.clone(),
            labels: net.metadata.labels.clone(),
            mac_address: net.spec.mac_address.clone(),
            bridge: net.spec.bridge.clone(),
            mode: net.spec.mode,
            net_address: net.spec.net_address,
            netmask: net.spec.netmask,
            dhcp: net.spec.dhcp,
            autostart: net.spec.autostart,
        }
    }
}

impl NewVm {
    /// Build the insert parameters once the VM's dependencies are resolved.
    pub fn resolved(
        vm: &VirtualMachine,
        network_id: i64,
        store_id: i64,
        mac_address: Option<String>,
        disk_path: PathBuf,
    ) -> Self {
        NewVm {
            name: vm.metadata.name.clone(),
            namespace: vm.metadata.namespace.clone(),
            labels: vm.metadata.labels.clone(),
            cpu: vm.spec.cpu,
            ram: vm.spec.memory,
            mac_address,
            ip_address: vm.spec.network.ip,
            network_id,
            store_id,
            image: vm.spec.image.clone(),
            disk_size: vm.spec.disk.size.clone(),
            disk_path,
            autostart: vm.spec.autostart,
        }
    }
}

impl StoreRecord {
    pub fn to_resource(&self) -> Store {
        Store {
            api_version: None,
            metadata: Metadata {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels: self.labels.clone(),
            },
            spec: StoreSpec {
                backend: self.backend.clone(),
                paths: StorePaths {
                    artifacts: self.artifacts_path.clone(),
                    images: self.images_path.clone(),
                },
                images: self
                    .images
                    .iter()
                    .map(|i| {
                        (
                            i.name.clone(),
                            ImageSpec {
                                version: i.version.clone(),
                                os_profile: i.os_profile.clone(),
                                directory: i.directory.clone(),
                                file: i.file.clone(),
                                checksum: i.checksum.clone(),
                                size: i.size.clone(),
                            },
                        )
                    })
                    .collect(),
            },
        }
    }
}

impl NetworkRecord {
    pub fn to_resource(&self) -> Network {
        Network {
            api_version: None,
            metadata: Metadata {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels: self.labels.clone(),
            },
            spec: NetworkSpec {
                bridge: self.bridge.clone(),
                mode: self.mode,
                net_address: self.net_address,
                netmask: self.netmask,
                dhcp: self.dhcp,
                autostart: self.autostart,
                mac_address: self.mac_address.clone(),
            },
        }
    }
}

impl VmRecord {
    /// Rebuild the manifest form. Foreign keys are turned back into names
    /// by the caller, which has the network and store records at hand.
    pub fn to_resource(&self, network_name: &str, store_name: &str) -> VirtualMachine {
        VirtualMachine {
            api_version: None,
            metadata: Metadata {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels: self.labels.clone(),
            },
            spec: VmSpec {
                cpu: self.cpu,
                memory: self.ram,
                image: self.image.clone(),
                store: Some(store_name.to_string()),
                disk: DiskSpec {
                    size: self.disk_size.clone(),
                },
                network: NicSpec {
                    name: network_name.to_string(),
                    mac_address: self.mac_address.clone(),
                    ip: self.ip_address,
                },
                autostart: self.autostart,
            },
        }
    }
}
