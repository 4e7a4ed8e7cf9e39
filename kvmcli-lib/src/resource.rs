// SPDX-License-Identifier: GPL-2.0-only
use crate::network::Network;
use crate::store::Store;
use crate::vm::VirtualMachine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource kind. The derived ordering is the apply order: stores first,
/// then networks, then virtual machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Store,
    Network,
    VirtualMachine,
}

impl Kind {
    /// The `kind:` value used in manifest documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Store => "Store",
            Kind::Network => "Network",
            Kind::VirtualMachine => "VirtualMachine",
        }
    }

    /// Short lowercase form used in log lines and `kind/name` references.
    pub fn short(&self) -> &'static str {
        match self {
            Kind::Store => "store",
            Kind::Network => "network",
            Kind::VirtualMachine => "vm",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Store" => Ok(Kind::Store),
            "Network" => Ok(Kind::Network),
            "VirtualMachine" => Ok(Kind::VirtualMachine),
            _ => Err(format!(
                "invalid kind: '{s}' (expected: Store, Network, VirtualMachine)"
            )),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new(name: &str, namespace: &str) -> Self {
        Metadata {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::new(),
        }
    }
}

/// One decoded manifest document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Resource {
    Store(Store),
    Network(Network),
    VirtualMachine(VirtualMachine),
}

impl Resource {
    pub fn kind(&self) -> Kind {
        match self {
            Resource::Store(_) => Kind::Store,
            Resource::Network(_) => Kind::Network,
            Resource::VirtualMachine(_) => Kind::VirtualMachine,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Resource::Store(s) => &s.metadata,
            Resource::Network(n) => &n.metadata,
            Resource::VirtualMachine(v) => &v.metadata,
        }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind(), self.metadata())
    }
}

/// `kind/name` handle used in logs, errors and apply reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: Kind,
    pub name: String,
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(kind: Kind, metadata: &Metadata) -> Self {
        ResourceRef {
            kind,
            name: metadata.name.clone(),
            namespace: metadata.namespace.clone(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.short(), self.name)
    }
}
