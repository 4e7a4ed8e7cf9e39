// SPDX-License-Identifier: GPL-2.0-only
/// Schema version. Bump when SCHEMA_SQL changes shape.
pub const SCHEMA_VERSION: u32 = 1;

/// Database schema. Every statement is `IF NOT EXISTS` so the batch can run
/// against a database that is already initialised.
pub const SCHEMA_SQL: &str = r#"
-- kvmcli database schema v1

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Image stores: where base images live and where overlays are written
CREATE TABLE IF NOT EXISTS stores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT 'default',
    labels TEXT NOT NULL DEFAULT '{}',
    backend TEXT NOT NULL,
    artifacts_path TEXT NOT NULL,
    images_path TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- Base images, owned by a store
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    store_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '',
    os_profile TEXT NOT NULL DEFAULT '',
    directory TEXT NOT NULL DEFAULT '',
    file TEXT NOT NULL,
    checksum TEXT NOT NULL DEFAULT '',
    size TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    FOREIGN KEY (store_id) REFERENCES stores(id) ON DELETE CASCADE,
    UNIQUE (store_id, name)
);

-- Virtual networks (libvirt network definitions)
CREATE TABLE IF NOT EXISTS networks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT 'default',
    labels TEXT NOT NULL DEFAULT '{}',
    mac_address TEXT,
    bridge TEXT,
    mode TEXT NOT NULL CHECK(mode IN ('nat', 'route', 'bridge', 'open', 'isolated')),
    net_address TEXT NOT NULL,
    netmask TEXT NOT NULL,
    dhcp TEXT,
    autostart INTEGER NOT NULL DEFAULT 0 CHECK(autostart IN (0, 1)),
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- Virtual machines (libvirt domains)
CREATE TABLE IF NOT EXISTS vms (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    namespace TEXT NOT NULL DEFAULT 'default',
    cpu INTEGER NOT NULL,
    ram INTEGER NOT NULL,
    mac_address TEXT,
    ip_address TEXT,
    network_id INTEGER NOT NULL,
    store_id INTEGER NOT NULL,
    image TEXT NOT NULL,
    disk_size TEXT,
    disk_path TEXT NOT NULL,
    autostart INTEGER NOT NULL DEFAULT 0 CHECK(autostart IN (0, 1)),
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    labels TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (network_id) REFERENCES networks(id) ON DELETE RESTRICT,
    FOREIGN KEY (store_id) REFERENCES stores(id) ON DELETE RESTRICT
);

-- Natural keys
CREATE UNIQUE INDEX IF NOT EXISTS idx_stores_name_namespace ON stores(name, namespace);
CREATE UNIQUE INDEX IF NOT EXISTS idx_networks_name_namespace ON networks(name, namespace);
CREATE UNIQUE INDEX IF NOT EXISTS idx_vms_name_namespace ON vms(name, namespace);

CREATE INDEX IF NOT EXISTS idx_images_name ON images(name);
CREATE INDEX IF NOT EXISTS idx_vms_network_id ON vms(network_id);
CREATE INDEX IF NOT EXISTS idx_vms_store_id ON vms(store_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn schema_batch_is_rerunnable() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
    }

    #[test]
    fn images_cascade_with_their_store() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute(
            "INSERT INTO stores (name, backend, artifacts_path, images_path) VALUES ('base', 'local', '/a', '/i')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO images (store_id, name, file) VALUES (1, 'rocky-9', 'rocky.qcow2')",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM stores WHERE id = 1", []).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM images", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn vm_rows_block_store_delete() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute_batch(
            "INSERT INTO stores (name, backend, artifacts_path, images_path) VALUES ('base', 'local', '/a', '/i');
             INSERT INTO networks (name, mode, net_address, netmask) VALUES ('lab', 'nat', '192.168.100.1', '255.255.255.0');
             INSERT INTO vms (name, cpu, ram, network_id, store_id, image, disk_path)
                 VALUES ('vm-01', 2, 2048, 1, 1, 'rocky-9', '/i/vm-01.qcow2');",
        )
        .unwrap();
        assert!(conn.execute("DELETE FROM stores WHERE id = 1", []).is_err());
    }
}
