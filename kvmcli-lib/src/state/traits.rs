// SPDX-License-Identifier: GPL-2.0-only
use crate::record::{
    ImageRecord, NetworkRecord, NewNetwork, NewStore, NewVm, StoreRecord, VmRecord,
};

/// Information about the database for status reporting.
#[derive(Debug, Clone)]
pub struct DbStatus {
    /// Path to the database file
    pub path: String,
    /// Number of user tables in the database
    pub table_count: usize,
    /// Size of the database file in bytes (None if not applicable)
    pub size_bytes: Option<u64>,
}

/// Errors from the state store.
///
/// A lookup that finds nothing is not an error: getters return `Ok(None)`.
#[derive(Debug)]
pub enum StoreError {
    /// Database connection or initialization failed
    Init(String),
    /// Query execution failed
    Query(String),
    /// Schema on disk was written by a different version
    SchemaMismatch { expected: u32, found: u32 },
    /// Unique key collision, ambiguous name, or dependents block the operation
    Conflict(String),
    /// A foreign key points at a row that does not exist
    ForeignKey(String),
    /// Invalid input (e.g., empty name)
    InvalidInput(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Init(e) => write!(f, "store initialization failed: {e}"),
            StoreError::Query(e) => write!(f, "store query failed: {e}"),
            StoreError::SchemaMismatch { expected, found } => {
                write!(f, "schema version mismatch: expected {expected}, found {found}")
            }
            StoreError::Conflict(e) => write!(f, "conflict: {e}"),
            StoreError::ForeignKey(e) => write!(f, "dangling reference: {e}"),
            StoreError::InvalidInput(e) => write!(f, "invalid input: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Store (and owned image) record persistence.
pub trait StoreTable {
    /// Insert a store and all of its images in one transaction.
    fn insert_store(&self, params: &NewStore) -> Result<StoreRecord, StoreError>;

    /// Get a store by name, whatever its namespace.
    /// Fails with Conflict if the name exists in more than one namespace.
    fn get_store_by_name(&self, name: &str) -> Result<Option<StoreRecord>, StoreError>;

    fn get_store(&self, name: &str, namespace: &str) -> Result<Option<StoreRecord>, StoreError>;

    fn get_store_by_id(&self, id: i64) -> Result<Option<StoreRecord>, StoreError>;

    /// List stores, optionally restricted to one namespace.
    fn list_stores(&self, namespace: Option<&str>) -> Result<Vec<StoreRecord>, StoreError>;

    /// Delete a store and its images. Returns false if no such store.
    /// Fails with Conflict while VM records still reference it.
    fn delete_store(&self, name: &str, namespace: &str) -> Result<bool, StoreError>;

    /// Stores that carry an image with this name.
    fn stores_with_image(&self, image: &str) -> Result<Vec<StoreRecord>, StoreError>;

    fn find_image(&self, store_id: i64, image: &str) -> Result<Option<ImageRecord>, StoreError>;
}

/// Network record persistence.
pub trait NetworkTable {
    fn insert_network(&self, params: &NewNetwork) -> Result<NetworkRecord, StoreError>;

    /// Get a network by name, whatever its namespace.
    /// Fails with Conflict if the name exists in more than one namespace.
    fn get_network_by_name(&self, name: &str) -> Result<Option<NetworkRecord>, StoreError>;

    fn get_network(&self, name: &str, namespace: &str) -> Result<Option<NetworkRecord>, StoreError>;

    fn get_network_by_id(&self, id: i64) -> Result<Option<NetworkRecord>, StoreError>;

    fn list_networks(&self, namespace: Option<&str>) -> Result<Vec<NetworkRecord>, StoreError>;

    /// Returns false if no such network.
    /// Fails with Conflict while VM records still reference it.
    fn delete_network(&self, name: &str, namespace: &str) -> Result<bool, StoreError>;
}

/// VM record persistence.
pub trait VmTable {
    /// Fails with ForeignKey if the network or store id does not exist.
    fn insert_vm(&self, params: &NewVm) -> Result<VmRecord, StoreError>;

    fn get_vm_by_name(&self, name: &str) -> Result<Option<VmRecord>, StoreError>;

    fn get_vm(&self, name: &str, namespace: &str) -> Result<Option<VmRecord>, StoreError>;

    fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<VmRecord>, StoreError>;

    /// Returns false if no such VM.
    fn delete_vm(&self, name: &str, namespace: &str) -> Result<bool, StoreError>;

    /// Names of VMs built on the given store.
    fn vms_using_store(&self, store_id: i64) -> Result<Vec<String>, StoreError>;

    /// Names of VMs attached to the given network.
    fn vms_using_network(&self, network_id: i64) -> Result<Vec<String>, StoreError>;
}

/// Full persistence interface handed to the lifecycles and the operator.
pub trait StateStore: StoreTable + NetworkTable + VmTable {
    /// Create the schema if needed. Safe to call on every startup.
    fn init(&self) -> Result<(), StoreError>;

    fn status(&self) -> Result<DbStatus, StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}
