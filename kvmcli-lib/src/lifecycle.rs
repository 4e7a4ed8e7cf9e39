// SPDX-License-Identifier: GPL-2.0-only
//! Errors shared by the per-kind lifecycles.
//!
//! Every variant names the resource it concerns (`vm/vm-01`) so a batch run
//! can report failures without extra context.

use crate::backend::traits::OverlayError;
use crate::hypervisor::traits::HypervisorError;
use crate::resource::ResourceRef;
use crate::state::traits::StoreError;
use crate::xml::BuildError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// `dependency` describes what was missing, e.g. `network 'ghost'`.
    #[error("{resource}: {dependency} not found")]
    DependencyNotFound {
        resource: ResourceRef,
        dependency: String,
    },

    #[error("{resource}: already exists")]
    AlreadyExists { resource: ResourceRef },

    #[error("{resource}: not found")]
    NotFound { resource: ResourceRef },

    #[error("{resource}: still used by {}", .users.join(", "))]
    InUse {
        resource: ResourceRef,
        users: Vec<String>,
    },

    #[error("{resource}: {reason}")]
    Invalid { resource: ResourceRef, reason: String },

    #[error("{resource}: no hypervisor connection")]
    NoConnection { resource: ResourceRef },

    #[error("{resource}: {step}: {source}")]
    Hypervisor {
        resource: ResourceRef,
        step: &'static str,
        source: HypervisorError,
    },

    #[error("{resource}: {step}: {source}")]
    Store {
        resource: ResourceRef,
        step: &'static str,
        source: StoreError,
    },

    #[error("{resource}: {step}: {source}")]
    Overlay {
        resource: ResourceRef,
        step: &'static str,
        source: OverlayError,
    },

    #[error("{resource}: {step}: {source}")]
    Build {
        resource: ResourceRef,
        step: &'static str,
        source: BuildError,
    },
}

impl LifecycleError {
    pub fn resource(&self) -> &ResourceRef {
        match self {
            LifecycleError::DependencyNotFound { resource, .. }
            | LifecycleError::AlreadyExists { resource }
            | LifecycleError::NotFound { resource }
            | LifecycleError::InUse { resource, .. }
            | LifecycleError::Invalid { resource, .. }
            | LifecycleError::NoConnection { resource }
            | LifecycleError::Hypervisor { resource, .. }
            | LifecycleError::Store { resource, .. }
            | LifecycleError::Overlay { resource, .. }
            | LifecycleError::Build { resource, .. } => resource,
        }
    }
}

/// Shorthands for wrapping collaborator errors with the resource and step.
pub(crate) trait Context<T> {
    fn step(self, resource: &ResourceRef, step: &'static str) -> Result<T, LifecycleError>;
}

impl<T> Context<T> for Result<T, HypervisorError> {
    fn step(self, resource: &ResourceRef, step: &'static str) -> Result<T, LifecycleError> {
        self.map_err(|source| LifecycleError::Hypervisor {
            resource: resource.clone(),
            step,
            source,
        })
    }
}

impl<T> Context<T> for Result<T, StoreError> {
    fn step(self, resource: &ResourceRef, step: &'static str) -> Result<T, LifecycleError> {
        self.map_err(|source| LifecycleError::Store {
            resource: resource.clone(),
            step,
            source,
        })
    }
}

impl<T> Context<T> for Result<T, OverlayError> {
    fn step(self, resource: &ResourceRef, step: &'static str) -> Result<T, LifecycleError> {
        self.map_err(|source| LifecycleError::Overlay {
            resource: resource.clone(),
            step,
            source,
        })
    }
}

impl<T> Context<T> for Result<T, BuildError> {
    fn step(self, resource: &ResourceRef, step: &'static str) -> Result<T, LifecycleError> {
        self.map_err(|source| LifecycleError::Build {
            resource: resource.clone(),
            step,
            source,
        })
    }
}
