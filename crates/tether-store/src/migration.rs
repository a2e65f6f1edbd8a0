//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    // Create migrations table if it doesn't exist
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Get current version
    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    // Apply migrations
    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Known application identities
        CREATE TABLE app_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT NOT NULL,            -- package name
            signature TEXT NOT NULL,          -- signature digest, platform-supplied

            UNIQUE(package, signature)
        );

        -- Materialized latest state of every data item. One row per
        -- (application, host, path); writes overwrite in place.
        CREATE TABLE data_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            app_id INTEGER NOT NULL REFERENCES app_keys(id),
            host TEXT NOT NULL,               -- authoring-node host component
            path TEXT NOT NULL,               -- absolute item path
            seq INTEGER NOT NULL,             -- sequence within the source node's stream
            source_node TEXT NOT NULL,        -- node that authored this mutation
            payload BLOB,                     -- nullable once tombstoned
            deleted INTEGER NOT NULL DEFAULT 0,
            last_modified INTEGER NOT NULL,   -- wall clock ms, advisory only

            UNIQUE(app_id, host, path)
        );

        -- Asset presence, keyed by content digest (lowercase hex)
        CREATE TABLE assets (
            digest TEXT PRIMARY KEY,
            present INTEGER NOT NULL DEFAULT 0,
            added_at INTEGER NOT NULL
        );

        -- Item -> asset references, rewritten on every item write
        CREATE TABLE asset_refs (
            item_id INTEGER NOT NULL REFERENCES data_items(id),
            name TEXT NOT NULL,
            digest TEXT NOT NULL,

            PRIMARY KEY (item_id, name)
        );

        -- Asset read grants, (application, digest)
        CREATE TABLE asset_acls (
            app_id INTEGER NOT NULL REFERENCES app_keys(id),
            digest TEXT NOT NULL,

            UNIQUE(app_id, digest)
        );

        -- Known peer endpoints for the reconnect scan
        CREATE TABLE connection_configs (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,               -- transport kind ("tcp", "memory")
            address TEXT NOT NULL,
            role INTEGER NOT NULL,            -- 1=dialer, 2=listener
            enabled INTEGER NOT NULL DEFAULT 1,
            node_id TEXT NOT NULL DEFAULT '', -- peer node id, learned at handshake
            last_connected INTEGER NOT NULL DEFAULT 0
        );

        -- Monotonic counters
        CREATE TABLE counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        INSERT INTO counters (name, value) VALUES ('local_seq', 0);

        -- Item rows joined with their application identity plus the derived
        -- readiness flag: ready when every referenced asset is present.
        -- Tombstones are always ready.
        CREATE VIEW item_state AS
        SELECT
            data_items.id AS id,
            app_keys.package AS package,
            app_keys.signature AS signature,
            data_items.host AS host,
            data_items.path AS path,
            data_items.seq AS seq,
            data_items.source_node AS source_node,
            data_items.payload AS payload,
            data_items.deleted AS deleted,
            data_items.last_modified AS last_modified,
            (data_items.deleted != 0 OR NOT EXISTS (
                SELECT 1 FROM asset_refs ar
                LEFT JOIN assets a ON a.digest = ar.digest
                WHERE ar.item_id = data_items.id AND COALESCE(a.present, 0) = 0
            )) AS assets_ready
        FROM data_items
        JOIN app_keys ON app_keys.id = data_items.app_id;

        -- Indexes for common queries
        CREATE UNIQUE INDEX idx_items_source_seq ON data_items(source_node, seq);
        CREATE INDEX idx_items_host_path ON data_items(host, path);
        CREATE INDEX idx_refs_digest ON asset_refs(digest);
        CREATE INDEX idx_acls_digest ON asset_acls(digest);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"app_keys".to_string()));
        assert!(tables.contains(&"data_items".to_string()));
        assert!(tables.contains(&"assets".to_string()));
        assert!(tables.contains(&"asset_refs".to_string()));
        assert!(tables.contains(&"asset_acls".to_string()));
        assert!(tables.contains(&"connection_configs".to_string()));
        assert!(tables.contains(&"counters".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));

        let views: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='view'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        assert!(views.contains(&"item_state".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap(); // Should not error
        migrate(&mut conn).unwrap(); // Still should not error

        // Verify version is 1
        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_seq_counter_seeded() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let value: i64 = conn
            .query_row(
                "SELECT value FROM counters WHERE name = 'local_seq'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, 0);
    }
}
