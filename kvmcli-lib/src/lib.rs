// SPDX-License-Identifier: GPL-2.0-only
pub mod backend;
pub mod config;
pub mod hypervisor;
pub mod lifecycle;
pub mod manifest;
pub mod network;
pub mod network_service;
pub mod operator;
pub mod record;
pub mod resource;
pub mod state;
pub mod store;
pub mod store_service;
pub mod vm;
pub mod vm_service;
pub mod xml;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[cfg(test)]
mod lifecycle_tests;
