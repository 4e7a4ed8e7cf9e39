// SPDX-License-Identifier: GPL-2.0-only
use crate::record::{
    ImageRecord, NetworkRecord, NewNetwork, NewStore, NewVm, StoreRecord, VmRecord,
};
use crate::state::schema::{SCHEMA_SQL, SCHEMA_VERSION};
use crate::state::traits::{
    DbStatus, NetworkTable, StateStore, StoreError, StoreTable, VmTable,
};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const STORE_COLUMNS: &str =
    "id, name, namespace, labels, backend, artifacts_path, images_path, created_at";
const IMAGE_COLUMNS: &str =
    "id, store_id, name, version, os_profile, directory, file, checksum, size, created_at";
const NETWORK_COLUMNS: &str = "id, name, namespace, labels, mac_address, bridge, mode, \
     net_address, netmask, dhcp, autostart, created_at";
const VM_COLUMNS: &str = "id, name, namespace, labels, cpu, ram, mac_address, ip_address, \
     network_id, store_id, image, disk_size, disk_path, autostart, created_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

/// Enable WAL mode and foreign key enforcement on a connection.
fn configure_connection(conn: &Connection) -> Result<(), StoreError> {
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
        .map_err(|e| StoreError::Init(format!("cannot set WAL mode: {e}")))?;
    if mode != "wal" {
        return Err(StoreError::Init(format!(
            "failed to enable WAL mode: journal_mode is '{mode}'"
        )));
    }

    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| StoreError::Init(format!("cannot enable foreign keys: {e}")))?;

    Ok(())
}

/// Translate a failed INSERT/DELETE into the matching StoreError.
fn write_error(e: rusqlite::Error, action: &str, what: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            match err.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return StoreError::ForeignKey(format!("cannot {action} {what}: {e}"));
                }
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return StoreError::Conflict(format!("{what} already exists"));
                }
                _ => return StoreError::InvalidInput(format!("cannot {action} {what}: {e}")),
            }
        }
    }
    StoreError::Query(format!("cannot {action} {what}: {e}"))
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn optional_parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::InvalidInput(format!("cannot encode {what}: {e}")))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn row_to_store(row: &Row<'_>) -> rusqlite::Result<StoreRecord> {
    Ok(StoreRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        labels: json_column(row, 3)?,
        backend: row.get(4)?,
        artifacts_path: PathBuf::from(row.get::<_, String>(5)?),
        images_path: PathBuf::from(row.get::<_, String>(6)?),
        images: Vec::new(),
        created_at: row.get(7)?,
    })
}

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        store_id: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        os_profile: row.get(4)?,
        directory: row.get(5)?,
        file: row.get(6)?,
        checksum: row.get(7)?,
        size: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_network(row: &Row<'_>) -> rusqlite::Result<NetworkRecord> {
    let dhcp: Option<String> = row.get(9)?;
    Ok(NetworkRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        labels: json_column(row, 3)?,
        mac_address: row.get(4)?,
        bridge: row.get(5)?,
        mode: parsed_column(row, 6)?,
        net_address: parsed_column(row, 7)?,
        netmask: parsed_column(row, 8)?,
        dhcp: dhcp
            .map(|d| serde_json::from_str(&d).map_err(|e| conversion_error(9, e)))
            .transpose()?,
        autostart: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn row_to_vm(row: &Row<'_>) -> rusqlite::Result<VmRecord> {
    Ok(VmRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        labels: json_column(row, 3)?,
        cpu: row.get(4)?,
        ram: row.get(5)?,
        mac_address: row.get(6)?,
        ip_address: optional_parsed_column(row, 7)?,
        network_id: row.get(8)?,
        store_id: row.get(9)?,
        image: row.get(10)?,
        disk_size: row.get(11)?,
        disk_path: PathBuf::from(row.get::<_, String>(12)?),
        autostart: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn query_images(conn: &Connection, store_id: i64) -> Result<Vec<ImageRecord>, StoreError> {
    let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE store_id = ?1 ORDER BY name");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StoreError::Query(format!("cannot prepare image query: {e}")))?;
    let images = stmt
        .query_map(params![store_id], row_to_image)
        .map_err(|e| StoreError::Query(format!("cannot list images: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Query(format!("cannot read image row: {e}")))?;
    Ok(images)
}

fn query_stores(
    conn: &Connection,
    filter: &str,
    args: &[&dyn ToSql],
) -> Result<Vec<StoreRecord>, StoreError> {
    let sql = format!("SELECT {STORE_COLUMNS} FROM stores {filter} ORDER BY id");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StoreError::Query(format!("cannot prepare store query: {e}")))?;
    let mut stores = stmt
        .query_map(args, row_to_store)
        .map_err(|e| StoreError::Query(format!("cannot list stores: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Query(format!("cannot read store row: {e}")))?;
    for store in &mut stores {
        store.images = query_images(conn, store.id)?;
    }
    Ok(stores)
}

fn query_networks(
    conn: &Connection,
    filter: &str,
    args: &[&dyn ToSql],
) -> Result<Vec<NetworkRecord>, StoreError> {
    let sql = format!("SELECT {NETWORK_COLUMNS} FROM networks {filter} ORDER BY id");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StoreError::Query(format!("cannot prepare network query: {e}")))?;
    let networks = stmt
        .query_map(args, row_to_network)
        .map_err(|e| StoreError::Query(format!("cannot list networks: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Query(format!("cannot read network row: {e}")))?;
    Ok(networks)
}

fn query_vms(
    conn: &Connection,
    filter: &str,
    args: &[&dyn ToSql],
) -> Result<Vec<VmRecord>, StoreError> {
    let sql = format!("SELECT {VM_COLUMNS} FROM vms {filter} ORDER BY id");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StoreError::Query(format!("cannot prepare VM query: {e}")))?;
    let vms = stmt
        .query_map(args, row_to_vm)
        .map_err(|e| StoreError::Query(format!("cannot list VMs: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Query(format!("cannot read VM row: {e}")))?;
    Ok(vms)
}

/// Collapse a by-name lookup: names may repeat across namespaces.
fn single<T>(mut rows: Vec<T>, kind: &str, name: &str) -> Result<Option<T>, StoreError> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        n => Err(StoreError::Conflict(format!(
            "{kind} name '{name}' is ambiguous ({n} namespaces); use name and namespace"
        ))),
    }
}

/// Names of VMs whose `column` references `id`. `column` is never user input.
fn vm_names(conn: &Connection, column: &str, id: i64) -> Result<Vec<String>, StoreError> {
    let sql = format!("SELECT name FROM vms WHERE {column} = ?1 ORDER BY name");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StoreError::Query(format!("cannot prepare dependents query: {e}")))?;
    let names = stmt
        .query_map(params![id], |row| row.get(0))
        .map_err(|e| StoreError::Query(format!("cannot list dependent VMs: {e}")))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| StoreError::Query(format!("cannot read dependent VM: {e}")))?;
    Ok(names)
}

fn lookup_id(
    conn: &Connection,
    table: &str,
    name: &str,
    namespace: &str,
) -> Result<Option<i64>, StoreError> {
    let sql = format!("SELECT id FROM {table} WHERE name = ?1 AND namespace = ?2");
    conn.query_row(&sql, params![name, namespace], |row| row.get(0))
        .optional()
        .map_err(|e| StoreError::Query(format!("cannot look up {table} '{name}': {e}")))
}

fn require_name(name: &str, kind: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::InvalidInput(format!("{kind} name must not be empty")));
    }
    Ok(())
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    /// Creates the parent directory if it doesn't exist.
    /// Does NOT initialize the schema. Call `init()` after opening.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Init(format!("cannot create directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            StoreError::Init(format!("cannot open database {}: {e}", path.display()))
        })?;

        configure_connection(&conn)?;

        Ok(SqliteStore {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    /// Open the database and make sure the schema is in place.
    /// This is the primary entry point for production use.
    pub fn open_and_init(path: &Path) -> Result<Self, StoreError> {
        let store = Self::open(path)?;
        store.init()?;
        tracing::debug!(path = %path.display(), "state store ready");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Query("database connection lock poisoned".to_string()))
    }

    /// Stored schema version, or None on a fresh database.
    fn stored_version(&self) -> Result<Option<u32>, StoreError> {
        let conn = self.lock()?;
        let has_meta: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_meta'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Init(format!("cannot inspect schema: {e}")))?;
        if has_meta == 0 {
            return Ok(None);
        }
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Init(format!("cannot read schema version: {e}")))?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Count user tables (excludes sqlite_ internal tables).
    fn table_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let count: usize = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Query(format!("cannot count tables: {e}")))?;
        Ok(count)
    }

    /// Run raw SQL against the database. Used by tests to stage failures.
    #[cfg(any(test, feature = "test-support"))]
    pub fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| StoreError::Query(format!("cannot execute batch: {e}")))
    }
}

impl StateStore for SqliteStore {
    fn init(&self) -> Result<(), StoreError> {
        match self.stored_version()? {
            Some(version) if version == SCHEMA_VERSION => return Ok(()),
            Some(version) => {
                return Err(StoreError::SchemaMismatch {
                    expected: SCHEMA_VERSION,
                    found: version,
                })
            }
            None => {}
        }

        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::Init(format!("cannot create schema: {e}")))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| StoreError::Init(format!("cannot insert schema version: {e}")))?;

        Ok(())
    }

    fn status(&self) -> Result<DbStatus, StoreError> {
        let table_count = self.table_count()?;
        let size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).ok();

        Ok(DbStatus {
            path: self.db_path.to_string_lossy().to_string(),
            table_count,
            size_bytes,
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        // Flush the WAL into the main file; the handle itself closes on drop.
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|e| StoreError::Query(format!("cannot checkpoint WAL: {e}")))?;
        tracing::debug!(path = %self.db_path.display(), "state store closed");
        Ok(())
    }
}

impl StoreTable for SqliteStore {
    fn insert_store(&self, params: &NewStore) -> Result<StoreRecord, StoreError> {
        require_name(&params.name, "store")?;
        let what = format!("store '{}'", params.name);
        let labels = to_json(&params.labels, "labels")?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Query(format!("cannot begin transaction: {e}")))?;

        tx.execute(
            "INSERT INTO stores (name, namespace, labels, backend, artifacts_path, images_path) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                params.name,
                params.namespace,
                labels,
                params.backend,
                path_text(&params.artifacts_path),
                path_text(&params.images_path),
            ],
        )
        .map_err(|e| write_error(e, "insert", &what))?;
        let store_id = tx.last_insert_rowid();

        for image in &params.images {
            tx.execute(
                "INSERT INTO images (store_id, name, version, os_profile, directory, file, checksum, size) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    store_id,
                    image.name,
                    image.version,
                    image.os_profile,
                    image.directory,
                    image.file,
                    image.checksum,
                    image.size,
                ],
            )
            .map_err(|e| write_error(e, "insert", &format!("image '{}' in {what}", image.name)))?;
        }

        tx.commit()
            .map_err(|e| StoreError::Query(format!("cannot commit {what}: {e}")))?;

        single(
            query_stores(&conn, "WHERE id = ?1", params![store_id])?,
            "store",
            &params.name,
        )?
        .ok_or_else(|| StoreError::Query(format!("{what} vanished after insert")))
    }

    fn get_store_by_name(&self, name: &str) -> Result<Option<StoreRecord>, StoreError> {
        let conn = self.lock()?;
        single(query_stores(&conn, "WHERE name = ?1", params![name])?, "store", name)
    }

    fn get_store(&self, name: &str, namespace: &str) -> Result<Option<StoreRecord>, StoreError> {
        let conn = self.lock()?;
        let rows = query_stores(
            &conn,
            "WHERE name = ?1 AND namespace = ?2",
            params![name, namespace],
        )?;
        single(rows, "store", name)
    }

    fn get_store_by_id(&self, id: i64) -> Result<Option<StoreRecord>, StoreError> {
        let conn = self.lock()?;
        Ok(query_stores(&conn, "WHERE id = ?1", params![id])?.pop())
    }

    fn list_stores(&self, namespace: Option<&str>) -> Result<Vec<StoreRecord>, StoreError> {
        let conn = self.lock()?;
        query_stores(&conn, "WHERE (?1 IS NULL OR namespace = ?1)", params![namespace])
    }

    fn delete_store(&self, name: &str, namespace: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let Some(id) = lookup_id(&conn, "stores", name, namespace)? else {
            return Ok(false);
        };

        let users = vm_names(&conn, "store_id", id)?;
        if !users.is_empty() {
            return Err(StoreError::Conflict(format!(
                "store '{name}' is still used by VM(s): {}",
                users.join(", ")
            )));
        }

        let deleted = conn
            .execute("DELETE FROM stores WHERE id = ?1", params![id])
            .map_err(|e| write_error(e, "delete", &format!("store '{name}'")))?;
        Ok(deleted > 0)
    }

    fn stores_with_image(&self, image: &str) -> Result<Vec<StoreRecord>, StoreError> {
        let conn = self.lock()?;
        query_stores(
            &conn,
            "WHERE id IN (SELECT store_id FROM images WHERE name = ?1)",
            params![image],
        )
    }

    fn find_image(&self, store_id: i64, image: &str) -> Result<Option<ImageRecord>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE store_id = ?1 AND name = ?2");
        conn.query_row(&sql, params![store_id, image], row_to_image)
            .optional()
            .map_err(|e| StoreError::Query(format!("cannot look up image '{image}': {e}")))
    }
}

impl NetworkTable for SqliteStore {
    fn insert_network(&self, params: &NewNetwork) -> Result<NetworkRecord, StoreError> {
        require_name(&params.name, "network")?;
        let what = format!("network '{}'", params.name);
        let labels = to_json(&params.labels, "labels")?;
        let dhcp = params
            .dhcp
            .as_ref()
            .map(|d| to_json(d, "DHCP range"))
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO networks (name, namespace, labels, mac_address, bridge, mode, \
             net_address, netmask, dhcp, autostart) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                params.name,
                params.namespace,
                labels,
                params.mac_address,
                params.bridge,
                params.mode.as_str(),
                params.net_address.to_string(),
                params.netmask.to_string(),
                dhcp,
                params.autostart,
            ],
        )
        .map_err(|e| write_error(e, "insert", &what))?;
        let id = conn.last_insert_rowid();

        query_networks(&conn, "WHERE id = ?1", params![id])?
            .pop()
            .ok_or_else(|| StoreError::Query(format!("{what} vanished after insert")))
    }

    fn get_network_by_name(&self, name: &str) -> Result<Option<NetworkRecord>, StoreError> {
        let conn = self.lock()?;
        single(query_networks(&conn, "WHERE name = ?1", params![name])?, "network", name)
    }

    fn get_network(&self, name: &str, namespace: &str) -> Result<Option<NetworkRecord>, StoreError> {
        let conn = self.lock()?;
        let rows = query_networks(
            &conn,
            "WHERE name = ?1 AND namespace = ?2",
            params![name, namespace],
        )?;
        single(rows, "network", name)
    }

    fn get_network_by_id(&self, id: i64) -> Result<Option<NetworkRecord>, StoreError> {
        let conn = self.lock()?;
        Ok(query_networks(&conn, "WHERE id = ?1", params![id])?.pop())
    }

    fn list_networks(&self, namespace: Option<&str>) -> Result<Vec<NetworkRecord>, StoreError> {
        let conn = self.lock()?;
        query_networks(&conn, "WHERE (?1 IS NULL OR namespace = ?1)", params![namespace])
    }

    fn delete_network(&self, name: &str, namespace: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let Some(id) = lookup_id(&conn, "networks", name, namespace)? else {
            return Ok(false);
        };

        let users = vm_names(&conn, "network_id", id)?;
        if !users.is_empty() {
            return Err(StoreError::Conflict(format!(
                "network '{name}' is still used by VM(s): {}",
                users.join(", ")
            )));
        }

        let deleted = conn
            .execute("DELETE FROM networks WHERE id = ?1", params![id])
            .map_err(|e| write_error(e, "delete", &format!("network '{name}'")))?;
        Ok(deleted > 0)
    }
}

impl VmTable for SqliteStore {
    fn insert_vm(&self, params: &NewVm) -> Result<VmRecord, StoreError> {
        require_name(&params.name, "VM")?;
        let what = format!("VM '{}'", params.name);
        let labels = to_json(&params.labels, "labels")?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO vms (name, namespace, labels, cpu, ram, mac_address, ip_address, \
             network_id, store_id, image, disk_size, disk_path, autostart) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                params.name,
                params.namespace,
                labels,
                params.cpu,
                params.ram,
                params.mac_address,
                params.ip_address.map(|ip| ip.to_string()),
                params.network_id,
                params.store_id,
                params.image,
                params.disk_size,
                path_text(&params.disk_path),
                params.autostart,
            ],
        )
        .map_err(|e| write_error(e, "insert", &what))?;
        let id = conn.last_insert_rowid();

        query_vms(&conn, "WHERE id = ?1", params![id])?
            .pop()
            .ok_or_else(|| StoreError::Query(format!("{what} vanished after insert")))
    }

    fn get_vm_by_name(&self, name: &str) -> Result<Option<VmRecord>, StoreError> {
        let conn = self.lock()?;
        single(query_vms(&conn, "WHERE name = ?1", params![name])?, "VM", name)
    }

    fn get_vm(&self, name: &str, namespace: &str) -> Result<Option<VmRecord>, StoreError> {
        let conn = self.lock()?;
        let rows = query_vms(
            &conn,
            "WHERE name = ?1 AND namespace = ?2",
            params![name, namespace],
        )?;
        single(rows, "VM", name)
    }

    fn list_vms(&self, namespace: Option<&str>) -> Result<Vec<VmRecord>, StoreError> {
        let conn = self.lock()?;
        query_vms(&conn, "WHERE (?1 IS NULL OR namespace = ?1)", params![namespace])
    }

    fn delete_vm(&self, name: &str, namespace: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM vms WHERE name = ?1 AND namespace = ?2",
                params![name, namespace],
            )
            .map_err(|e| write_error(e, "delete", &format!("VM '{name}'")))?;
        Ok(deleted > 0)
    }

    fn vms_using_store(&self, store_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        vm_names(&conn, "store_id", store_id)
    }

    fn vms_using_network(&self, network_id: i64) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        vm_names(&conn, "network_id", network_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{DhcpRange, ForwardMode};
    use crate::record::NewImage;
    use std::collections::BTreeMap;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_and_init(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn new_store(name: &str, namespace: &str) -> NewStore {
        NewStore {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::from([("tier".to_string(), "gold".to_string())]),
            backend: "local".to_string(),
            artifacts_path: PathBuf::from("/srv/artifacts"),
            images_path: PathBuf::from("/srv/images"),
            images: vec![NewImage {
                name: "rocky-9".to_string(),
                version: "9.5".to_string(),
                os_profile: "http://rockylinux.org/rocky/9".to_string(),
                directory: "rocky".to_string(),
                file: "rocky.qcow2".to_string(),
                checksum: "sha256:abc".to_string(),
                size: "10G".to_string(),
            }],
        }
    }

    fn new_network(name: &str) -> NewNetwork {
        NewNetwork {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::from([
                ("env".to_string(), "lab".to_string()),
                ("owner".to_string(), "ops".to_string()),
            ]),
            mac_address: None,
            bridge: Some("virbr-lab".to_string()),
            mode: ForwardMode::Nat,
            net_address: "192.168.100.1".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
            dhcp: Some(DhcpRange {
                start: "192.168.100.100".parse().unwrap(),
                end: "192.168.100.200".parse().unwrap(),
            }),
            autostart: true,
        }
    }

    fn new_vm(name: &str, network_id: i64, store_id: i64) -> NewVm {
        NewVm {
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::new(),
            cpu: 2,
            ram: 2048,
            mac_address: Some("02:aa:bb:00:64:0a".to_string()),
            ip_address: Some("192.168.100.10".parse().unwrap()),
            network_id,
            store_id,
            image: "rocky-9".to_string(),
            disk_size: Some("20G".to_string()),
            disk_path: PathBuf::from(format!("/srv/images/{name}.qcow2")),
            autostart: false,
        }
    }

    #[test]
    fn open_creates_new_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("test.db");
        let store = SqliteStore::open_and_init(&db_path).unwrap();
        assert!(db_path.exists());
        let status = store.status().unwrap();
        // schema_meta, stores, images, networks, vms (+ sqlite_sequence is filtered)
        assert_eq!(status.table_count, 5);
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        {
            let store = SqliteStore::open_and_init(&db_path).unwrap();
            store.insert_store(&new_store("base", "default")).unwrap();
            store.init().unwrap();
        }
        let store = SqliteStore::open_and_init(&db_path).unwrap();
        assert!(store.get_store("base", "default").unwrap().is_some());
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let (dir, store) = open_temp();
        store
            .execute_raw("UPDATE schema_meta SET value = '99' WHERE key = 'version'")
            .unwrap();
        drop(store);
        match SqliteStore::open_and_init(&dir.path().join("test.db")) {
            Err(StoreError::SchemaMismatch { expected, found }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(found, 99);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected schema mismatch"),
        }
    }

    #[test]
    fn foreign_keys_are_enabled() {
        let (_dir, store) = open_temp();
        let conn = store.conn.lock().unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn store_roundtrip_by_name_and_namespace() {
        let (_dir, store) = open_temp();
        let inserted = store.insert_store(&new_store("base", "infra")).unwrap();

        let by_name = store.get_store_by_name("base").unwrap().unwrap();
        let by_key = store.get_store("base", "infra").unwrap().unwrap();
        assert_eq!(by_name, inserted);
        assert_eq!(by_key, inserted);
        assert_eq!(inserted.labels.get("tier").map(String::as_str), Some("gold"));
        assert_eq!(inserted.images.len(), 1);
        let image = inserted.image("rocky-9").unwrap();
        assert_eq!(image.store_id, inserted.id);
        assert_eq!(image.os_profile, "http://rockylinux.org/rocky/9");
        assert!(inserted.created_at > 0);
    }

    #[test]
    fn get_absent_returns_none() {
        let (_dir, store) = open_temp();
        assert!(store.get_store_by_name("nope").unwrap().is_none());
        assert!(store.get_network("nope", "default").unwrap().is_none());
        assert!(store.get_vm("nope", "default").unwrap().is_none());
    }

    #[test]
    fn duplicate_store_is_conflict() {
        let (_dir, store) = open_temp();
        store.insert_store(&new_store("base", "default")).unwrap();
        let err = store.insert_store(&new_store("base", "default")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err}");
        // Same name in another namespace is fine
        store.insert_store(&new_store("base", "other")).unwrap();
    }

    #[test]
    fn ambiguous_name_lookup_is_conflict() {
        let (_dir, store) = open_temp();
        store.insert_store(&new_store("base", "a")).unwrap();
        store.insert_store(&new_store("base", "b")).unwrap();
        assert!(matches!(
            store.get_store_by_name("base"),
            Err(StoreError::Conflict(_))
        ));
        assert!(store.get_store("base", "b").unwrap().is_some());
    }

    #[test]
    fn failed_image_insert_rolls_back_store_row() {
        let (_dir, store) = open_temp();
        let mut params = new_store("base", "default");
        let dup = params.images[0].clone();
        params.images.push(dup);
        assert!(store.insert_store(&params).is_err());
        assert!(store.get_store("base", "default").unwrap().is_none());
        assert!(store.list_stores(None).unwrap().is_empty());
    }

    #[test]
    fn list_stores_filters_by_namespace() {
        let (_dir, store) = open_temp();
        store.insert_store(&new_store("a", "one")).unwrap();
        store.insert_store(&new_store("b", "two")).unwrap();
        assert_eq!(store.list_stores(None).unwrap().len(), 2);
        let one = store.list_stores(Some("one")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "a");
    }

    #[test]
    fn delete_store_cascades_images_and_is_idempotent() {
        let (_dir, store) = open_temp();
        let base = store.insert_store(&new_store("base", "default")).unwrap();
        assert!(store.delete_store("base", "default").unwrap());
        assert!(store.find_image(base.id, "rocky-9").unwrap().is_none());
        assert!(!store.delete_store("base", "default").unwrap());
    }

    #[test]
    fn store_and_image_by_id() {
        let (_dir, store) = open_temp();
        let base = store.insert_store(&new_store("base", "default")).unwrap();

        assert_eq!(store.get_store_by_id(base.id).unwrap().unwrap(), base);
        assert!(store.get_store_by_id(base.id + 1).unwrap().is_none());

        let image = store.find_image(base.id, "rocky-9").unwrap().unwrap();
        assert_eq!(image.file, "rocky.qcow2");
        assert!(store.find_image(base.id, "debian-12").unwrap().is_none());
        assert!(store.find_image(base.id + 1, "rocky-9").unwrap().is_none());
    }

    #[test]
    fn stores_with_image_finds_owners() {
        let (_dir, store) = open_temp();
        store.insert_store(&new_store("base", "default")).unwrap();
        let mut other = new_store("other", "default");
        other.images[0].name = "debian-12".to_string();
        store.insert_store(&other).unwrap();

        let owners = store.stores_with_image("rocky-9").unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "base");
        assert!(store.stores_with_image("alpine").unwrap().is_empty());
    }

    #[test]
    fn network_roundtrip_preserves_labels_and_dhcp() {
        let (_dir, store) = open_temp();
        let inserted = store.insert_network(&new_network("lab")).unwrap();
        let fetched = store.get_network_by_name("lab").unwrap().unwrap();
        assert_eq!(fetched, inserted);
        assert_eq!(fetched.labels.len(), 2);
        assert_eq!(fetched.dhcp, new_network("lab").dhcp);
        assert_eq!(fetched.mode, ForwardMode::Nat);
        assert!(fetched.autostart);
        assert_eq!(store.get_network_by_id(inserted.id).unwrap().unwrap(), inserted);
    }

    #[test]
    fn empty_network_name_is_invalid_input() {
        let (_dir, store) = open_temp();
        let err = store.insert_network(&new_network("")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[test]
    fn vm_insert_requires_existing_network_and_store() {
        let (_dir, store) = open_temp();
        let base = store.insert_store(&new_store("base", "default")).unwrap();
        let err = store.insert_vm(&new_vm("vm-01", 999, base.id)).unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey(_)), "got {err}");
        assert!(store.list_vms(None).unwrap().is_empty());
    }

    #[test]
    fn vm_roundtrip() {
        let (_dir, store) = open_temp();
        let base = store.insert_store(&new_store("base", "default")).unwrap();
        let lab = store.insert_network(&new_network("lab")).unwrap();
        let inserted = store.insert_vm(&new_vm("vm-01", lab.id, base.id)).unwrap();

        let fetched = store.get_vm("vm-01", "default").unwrap().unwrap();
        assert_eq!(fetched, inserted);
        assert_eq!(fetched.network_id, lab.id);
        assert_eq!(fetched.store_id, base.id);
        assert_eq!(fetched.ip_address, Some("192.168.100.10".parse().unwrap()));
        assert_eq!(store.get_vm_by_name("vm-01").unwrap().unwrap(), inserted);
    }

    #[test]
    fn dependents_block_store_and_network_delete() {
        let (_dir, store) = open_temp();
        let base = store.insert_store(&new_store("base", "default")).unwrap();
        let lab = store.insert_network(&new_network("lab")).unwrap();
        store.insert_vm(&new_vm("vm-01", lab.id, base.id)).unwrap();

        assert_eq!(store.vms_using_store(base.id).unwrap(), vec!["vm-01"]);
        assert_eq!(store.vms_using_network(lab.id).unwrap(), vec!["vm-01"]);
        assert!(matches!(
            store.delete_store("base", "default"),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.delete_network("lab", "default"),
            Err(StoreError::Conflict(_))
        ));

        assert!(store.delete_vm("vm-01", "default").unwrap());
        assert!(!store.delete_vm("vm-01", "default").unwrap());
        assert!(store.delete_network("lab", "default").unwrap());
        assert!(store.delete_store("base", "default").unwrap());
    }

    #[test]
    fn close_checkpoints_without_error() {
        let (_dir, store) = open_temp();
        store.insert_network(&new_network("lab")).unwrap();
        store.close().unwrap();
    }
}
