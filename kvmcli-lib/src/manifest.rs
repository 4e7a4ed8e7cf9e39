// SPDX-License-Identifier: GPL-2.0-only
//! Multi-document YAML manifests.
//!
//! Loading decodes every document into a typed [`Resource`], orders the set
//! for apply (stores, networks, VMs) and runs a resolution pass over the
//! whole set. Any error rejects the manifest as a whole.

use crate::network::Network;
use crate::resource::{Kind, Resource};
use crate::store::Store;
use crate::vm::VirtualMachine;
use serde::Deserialize;
use serde_norway::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read manifest {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Document numbers are 1-based.
    #[error("document {}: invalid YAML: {source}", .index + 1)]
    Syntax {
        index: usize,
        source: serde_norway::Error,
    },

    #[error("document {}: missing 'kind'", .index + 1)]
    MissingKind { index: usize },

    #[error("document {}: unknown kind '{kind}' (expected: Store, Network, VirtualMachine)", .index + 1)]
    UnknownKind { index: usize, kind: String },

    #[error("document {} ({kind}): {source}", .index + 1)]
    Decode {
        index: usize,
        kind: Kind,
        source: serde_norway::Error,
    },

    #[error("{kind} '{name}' is declared more than once in namespace '{namespace}'")]
    Duplicate {
        kind: Kind,
        name: String,
        namespace: String,
    },

    #[error("{resource}: {reason}")]
    Invalid { resource: String, reason: String },

    #[error("{resource}: {reason}")]
    Unresolved { resource: String, reason: String },
}

/// Read and parse a manifest file.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<Resource>, ManifestError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text)
}

/// Parse manifest text into resources in apply order.
pub fn parse(text: &str) -> Result<Vec<Resource>, ManifestError> {
    let mut resources = Vec::new();
    for (index, document) in serde_norway::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(document)
            .map_err(|source| ManifestError::Syntax { index, source })?;
        if value.is_null() {
            continue;
        }
        resources.push(decode(index, value)?);
    }

    // Stable: manifest order is kept within a kind.
    resources.sort_by_key(Resource::kind);
    resolve(&mut resources)?;

    tracing::debug!(count = resources.len(), "manifest parsed");
    Ok(resources)
}

fn decode(index: usize, value: Value) -> Result<Resource, ManifestError> {
    let kind = match value.get("kind") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(ManifestError::MissingKind { index }),
    };
    let kind: Kind = kind
        .parse()
        .map_err(|_| ManifestError::UnknownKind { index, kind })?;

    let wrap = |source| ManifestError::Decode {
        index,
        kind,
        source,
    };
    Ok(match kind {
        Kind::Store => Resource::Store(serde_norway::from_value::<Store>(value).map_err(wrap)?),
        Kind::Network => {
            Resource::Network(serde_norway::from_value::<Network>(value).map_err(wrap)?)
        }
        Kind::VirtualMachine => Resource::VirtualMachine(
            serde_norway::from_value::<VirtualMachine>(value).map_err(wrap)?,
        ),
    })
}

/// Cross-document checks, and store inference for VMs that do not name one.
fn resolve(resources: &mut [Resource]) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for resource in resources.iter() {
        let meta = resource.metadata();
        if meta.name.trim().is_empty() {
            return Err(ManifestError::Invalid {
                resource: resource.kind().short().to_string(),
                reason: "metadata.name must not be empty".to_string(),
            });
        }
        if !seen.insert((resource.kind(), meta.name.clone(), meta.namespace.clone())) {
            return Err(ManifestError::Duplicate {
                kind: resource.kind(),
                name: meta.name.clone(),
                namespace: meta.namespace.clone(),
            });
        }
    }

    let stores: Vec<Store> = resources
        .iter()
        .filter_map(|r| match r {
            Resource::Store(s) => Some(s.clone()),
            _ => None,
        })
        .collect();

    for resource in resources.iter_mut() {
        let Resource::VirtualMachine(vm) = resource else {
            continue;
        };
        let image = vm.spec.image.clone();
        let ns = vm.metadata.namespace.clone();
        match vm.spec.store.clone() {
            Some(name) => {
                // A store declared alongside must carry the image. Stores not
                // in this manifest are checked against the database at apply.
                let declared = stores
                    .iter()
                    .find(|s| s.metadata.name == name && s.metadata.namespace == ns);
                if let Some(store) = declared {
                    if store.image(&image).is_none() {
                        return Err(ManifestError::Unresolved {
                            resource: format!("vm/{}", vm.metadata.name),
                            reason: format!("store '{name}' has no image '{image}'"),
                        });
                    }
                }
            }
            None => {
                let holders: Vec<&Store> =
                    stores.iter().filter(|s| s.image(&image).is_some()).collect();
                if let [only] = holders.as_slice() {
                    vm.spec.store = Some(only.metadata.name.clone());
                }
            }
        }
    }
    Ok(())
}
