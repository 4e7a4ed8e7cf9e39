// SPDX-License-Identifier: GPL-2.0-only
use crate::resource::Metadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An image store: a directory of base images plus the directory where
/// per-VM overlays are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub metadata: Metadata,
    pub spec: StoreSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    #[serde(default = "default_backend")]
    pub backend: String,
    pub paths: StorePaths,
    #[serde(default)]
    pub images: BTreeMap<String, ImageSpec>,
}

fn default_backend() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePaths {
    /// Base images live under `<artifacts>/<image.directory>/<image.file>`
    pub artifacts: PathBuf,
    /// Overlays are written as `<images>/<vm-name>.qcow2`
    pub images: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    #[serde(default)]
    pub version: String,
    /// libosinfo id written into the domain metadata
    #[serde(default)]
    pub os_profile: String,
    #[serde(default)]
    pub directory: String,
    pub file: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub size: String,
}

impl Store {
    pub fn image(&self, name: &str) -> Option<&ImageSpec> {
        self.spec.images.get(name)
    }
}
