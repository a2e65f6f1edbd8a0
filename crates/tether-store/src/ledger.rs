//! SQLite ledger: the materialized data-item table and its satellites.
//!
//! One row per (application, host, path), overwritten in place; sequence
//! numbers are per authoring node and drive both replay protection and the
//! watermark exchange. Asset presence and read grants live in side tables,
//! and item readiness is derived from them at query time through the
//! `item_state` view.
//!
//! All access goes through `tokio::task::spawn_blocking` so SQLite never
//! blocks the async runtime.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use tether_core::{now_millis, AppKey, DataItemRecord, Digest, ItemUri, NodeId};

use crate::error::{Result, StoreError};
use crate::migration;

/// Outcome of applying a record to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// The row was written. Carries the stored record with its readiness
    /// computed against local asset presence.
    Applied(DataItemRecord),

    /// The stored row already carries this source at the same or a newer
    /// sequence; nothing was written.
    Stale,
}

impl ApplyResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyResult::Applied(_))
    }
}

/// SQLite-backed ledger.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime. Clones share one connection.
#[derive(Clone)]
pub struct Ledger {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation against the connection on the blocking
    /// pool.
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }

    /// Hand out the next locally authored sequence number. The first call
    /// on a fresh database returns 1.
    pub async fn next_seq(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row(
                "UPDATE counters SET value = value + 1 WHERE name = 'local_seq' RETURNING value",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
        .await
    }

    /// Apply a record to the ledger.
    ///
    /// Writes the row and its asset references in one transaction, creating
    /// placeholder asset rows (present = 0) for digests not seen before and
    /// granting the owning application read access to each. A replay from
    /// the same source at an equal or older sequence is reported as
    /// [`ApplyResult::Stale`] and leaves the row untouched.
    pub async fn put_record(&self, record: &DataItemRecord) -> Result<ApplyResult> {
        let record = record.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let result = write_record(&tx, &record)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    /// The live, ready item at exactly this (application, host, path).
    pub async fn get_item(&self, app: &AppKey, uri: &ItemUri) -> Result<Option<DataItemRecord>> {
        let app = app.clone();
        let uri = uri.clone();

        self.with_conn(move |conn| {
            let items = query_items(
                conn,
                "SELECT id, package, signature, host, path, seq, source_node, payload,
                        deleted, last_modified, assets_ready
                 FROM item_state
                 WHERE package = ?1 AND signature = ?2 AND host = ?3 AND path = ?4
                   AND deleted = 0 AND assets_ready = 1",
                params![app.package, app.signature, uri.host().as_str(), uri.path()],
            )?;
            Ok(items.into_iter().next())
        })
        .await
    }

    /// Live, ready items under a path prefix, optionally pinned to one
    /// host.
    pub async fn items_by_prefix(
        &self,
        app: &AppKey,
        host: Option<&NodeId>,
        prefix: &str,
    ) -> Result<Vec<DataItemRecord>> {
        let app = app.clone();
        let host = host.cloned();
        let prefix = prefix.to_string();

        self.with_conn(move |conn| match host {
            Some(host) => query_items(
                conn,
                "SELECT id, package, signature, host, path, seq, source_node, payload,
                        deleted, last_modified, assets_ready
                 FROM item_state
                 WHERE package = ?1 AND signature = ?2 AND host = ?3
                   AND substr(path, 1, length(?4)) = ?4
                   AND deleted = 0 AND assets_ready = 1
                 ORDER BY host, path",
                params![app.package, app.signature, host.as_str(), prefix],
            ),
            None => query_items(
                conn,
                "SELECT id, package, signature, host, path, seq, source_node, payload,
                        deleted, last_modified, assets_ready
                 FROM item_state
                 WHERE package = ?1 AND signature = ?2
                   AND substr(path, 1, length(?3)) = ?3
                   AND deleted = 0 AND assets_ready = 1
                 ORDER BY host, path",
                params![app.package, app.signature, prefix],
            ),
        })
        .await
    }

    /// Live, ready items at exactly `path`, across hosts. Capability
    /// lookups use this to see every node claiming one name.
    pub async fn items_at_path(&self, app: &AppKey, path: &str) -> Result<Vec<DataItemRecord>> {
        let app = app.clone();
        let path = path.to_string();

        self.with_conn(move |conn| {
            query_items(
                conn,
                "SELECT id, package, signature, host, path, seq, source_node, payload,
                        deleted, last_modified, assets_ready
                 FROM item_state
                 WHERE package = ?1 AND signature = ?2 AND path = ?3
                   AND deleted = 0 AND assets_ready = 1
                 ORDER BY host",
                params![app.package, app.signature, path],
            )
        })
        .await
    }

    /// Tombstone every live item of `app` at `path` (or under it, when
    /// `prefix` is set), re-authoring each as a fresh local mutation so the
    /// deletion propagates. Returns the tombstones written, in sequence
    /// order.
    pub async fn delete_items(
        &self,
        app: &AppKey,
        host: Option<&NodeId>,
        path: &str,
        prefix: bool,
        local: &NodeId,
    ) -> Result<Vec<DataItemRecord>> {
        let app = app.clone();
        let host = host.cloned();
        let path = path.to_string();
        let local = local.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let path_clause = if prefix {
                "substr(path, 1, length(?3)) = ?3"
            } else {
                "path = ?3"
            };
            let matches = match &host {
                Some(host) => query_items(
                    &tx,
                    &format!(
                        "SELECT id, package, signature, host, path, seq, source_node, payload,
                                deleted, last_modified, assets_ready
                         FROM item_state
                         WHERE package = ?1 AND signature = ?2 AND {path_clause} AND host = ?4
                           AND deleted = 0"
                    ),
                    params![app.package, app.signature, path, host.as_str()],
                )?,
                None => query_items(
                    &tx,
                    &format!(
                        "SELECT id, package, signature, host, path, seq, source_node, payload,
                                deleted, last_modified, assets_ready
                         FROM item_state
                         WHERE package = ?1 AND signature = ?2 AND {path_clause}
                           AND deleted = 0"
                    ),
                    params![app.package, app.signature, path],
                )?,
            };

            let mut tombstones = Vec::with_capacity(matches.len());
            for item in matches {
                let seq: i64 = tx.query_row(
                    "UPDATE counters SET value = value + 1 WHERE name = 'local_seq' RETURNING value",
                    [],
                    |row| row.get(0),
                )?;
                let tombstone = item.into_tombstone(local.clone(), seq);
                if let ApplyResult::Applied(stored) = write_record(&tx, &tombstone)? {
                    tombstones.push(stored);
                }
            }

            tx.commit()?;
            Ok(tombstones)
        })
        .await
    }

    /// Every record authored by `source` with sequence greater than `seq`,
    /// ascending. Tombstones and not-yet-ready items are included:
    /// readiness is receiver-local and must not hold back replication.
    pub async fn modified_since(&self, source: &NodeId, seq: i64) -> Result<Vec<DataItemRecord>> {
        let source = source.clone();

        self.with_conn(move |conn| {
            query_items(
                conn,
                "SELECT id, package, signature, host, path, seq, source_node, payload,
                        deleted, last_modified, assets_ready
                 FROM item_state
                 WHERE source_node = ?1 AND seq > ?2
                 ORDER BY seq ASC",
                params![source.as_str(), seq],
            )
        })
        .await
    }

    /// Highest sequence observed from `source`; 0 when nothing authored by
    /// that node is materialized.
    pub async fn watermark(&self, source: &NodeId) -> Result<i64> {
        let source = source.clone();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM data_items WHERE source_node = ?1",
                params![source.as_str()],
                |row| row.get(0),
            )
            .map_err(StoreError::from)
        })
        .await
    }

    /// Watermark for every authoring node with at least one materialized
    /// row.
    pub async fn source_watermarks(&self) -> Result<Vec<(NodeId, i64)>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT source_node, MAX(seq) FROM data_items GROUP BY source_node")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut marks = Vec::new();
            for row in rows {
                let (node, seq) = row?;
                marks.push((NodeId::new(node), seq));
            }
            Ok(marks)
        })
        .await
    }

    /// Record that the blob for `digest` is now in the content store.
    /// Returns true only on the transition from absent to present, so the
    /// caller can fire completions exactly once.
    pub async fn mark_asset_present(&self, digest: &Digest) -> Result<bool> {
        let hex = digest.to_hex();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO assets (digest, present, added_at) VALUES (?1, 0, ?2)",
                params![hex, now_millis()],
            )?;
            let changed = conn.execute(
                "UPDATE assets SET present = 1 WHERE digest = ?1 AND present = 0",
                params![hex],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Whether the ledger believes the blob for `digest` is locally
    /// present.
    pub async fn is_asset_present(&self, digest: &Digest) -> Result<bool> {
        let hex = digest.to_hex();

        self.with_conn(move |conn| {
            let present: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM assets WHERE digest = ?1 AND present = 1)",
                params![hex],
                |row| row.get(0),
            )?;
            Ok(present)
        })
        .await
    }

    /// Live items referencing `digest` that are fully ready. Called after a
    /// presence flip to find the items that flip completed.
    pub async fn newly_ready_items(&self, digest: &Digest) -> Result<Vec<DataItemRecord>> {
        let hex = digest.to_hex();

        self.with_conn(move |conn| {
            query_items(
                conn,
                "SELECT id, package, signature, host, path, seq, source_node, payload,
                        deleted, last_modified, assets_ready
                 FROM item_state
                 WHERE deleted = 0 AND assets_ready = 1
                   AND EXISTS (SELECT 1 FROM asset_refs ar
                               WHERE ar.item_id = item_state.id AND ar.digest = ?1)
                 ORDER BY host, path",
                params![hex],
            )
        })
        .await
    }

    /// Digests referenced by live items but absent locally, paired with an
    /// application that references each (named in the fetch request).
    pub async fn missing_assets(&self) -> Result<Vec<(Digest, AppKey)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT a.digest, k.package, k.signature
                 FROM assets a
                 JOIN asset_refs ar ON ar.digest = a.digest
                 JOIN data_items d ON d.id = ar.item_id
                 JOIN app_keys k ON k.id = d.app_id
                 WHERE a.present = 0 AND d.deleted = 0",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut missing = Vec::new();
            for row in rows {
                let (hex, package, signature) = row?;
                let digest = Digest::from_hex(&hex)
                    .map_err(|e| StoreError::InvalidData(format!("asset digest: {}", e)))?;
                missing.push((digest, AppKey::new(package, signature)));
            }
            Ok(missing)
        })
        .await
    }

    /// Grant `app` read access to the asset at `digest`.
    pub async fn grant_asset_access(&self, app: &AppKey, digest: &Digest) -> Result<()> {
        let app = app.clone();
        let hex = digest.to_hex();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO app_keys (package, signature) VALUES (?1, ?2)",
                params![app.package, app.signature],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO assets (digest, present, added_at) VALUES (?1, 0, ?2)",
                params![hex, now_millis()],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO asset_acls (app_id, digest)
                 SELECT id, ?3 FROM app_keys WHERE package = ?1 AND signature = ?2",
                params![app.package, app.signature, hex],
            )?;
            Ok(())
        })
        .await
    }

    /// Whether `app` has been granted read access to the asset at
    /// `digest`.
    pub async fn has_asset_access(&self, app: &AppKey, digest: &Digest) -> Result<bool> {
        let app = app.clone();
        let hex = digest.to_hex();

        self.with_conn(move |conn| {
            let allowed: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM asset_acls ac
                    JOIN app_keys k ON k.id = ac.app_id
                    WHERE k.package = ?1 AND k.signature = ?2 AND ac.digest = ?3)",
                params![app.package, app.signature, hex],
                |row| row.get(0),
            )?;
            Ok(allowed)
        })
        .await
    }

    /// Applications granted access to `digest`. Announced alongside the
    /// asset so the receiving side can mirror the grants.
    pub async fn asset_acl_apps(&self, digest: &Digest) -> Result<Vec<AppKey>> {
        let hex = digest.to_hex();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT k.package, k.signature
                 FROM asset_acls ac
                 JOIN app_keys k ON k.id = ac.app_id
                 WHERE ac.digest = ?1
                 ORDER BY k.package, k.signature",
            )?;
            let rows = stmt.query_map(params![hex], |row| {
                Ok(AppKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }
}

/// Insert or overwrite the row for `record` and rewrite its asset
/// references, inside the caller's transaction.
fn write_record(conn: &Connection, record: &DataItemRecord) -> Result<ApplyResult> {
    let now = now_millis();

    conn.execute(
        "INSERT OR IGNORE INTO app_keys (package, signature) VALUES (?1, ?2)",
        params![record.app.package, record.app.signature],
    )?;
    let app_id: i64 = conn.query_row(
        "SELECT id FROM app_keys WHERE package = ?1 AND signature = ?2",
        params![record.app.package, record.app.signature],
        |row| row.get(0),
    )?;

    // Within one authoring node's stream, last writer wins by sequence;
    // replays and reordered deliveries never regress the row. Across
    // streams the later arrival wins.
    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT source_node, seq FROM data_items
             WHERE app_id = ?1 AND host = ?2 AND path = ?3",
            params![app_id, record.uri.host().as_str(), record.uri.path()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if let Some((source, seq)) = existing {
        if source == record.source.as_str() && record.seq <= seq {
            return Ok(ApplyResult::Stale);
        }
    }

    let item_id: i64 = conn.query_row(
        "INSERT INTO data_items (app_id, host, path, seq, source_node, payload, deleted, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(app_id, host, path) DO UPDATE SET
             seq = excluded.seq,
             source_node = excluded.source_node,
             payload = excluded.payload,
             deleted = excluded.deleted,
             last_modified = excluded.last_modified
         RETURNING id",
        params![
            app_id,
            record.uri.host().as_str(),
            record.uri.path(),
            record.seq,
            record.source.as_str(),
            record.payload.as_deref(),
            record.deleted,
            record.last_modified,
        ],
        |row| row.get(0),
    )?;

    conn.execute(
        "DELETE FROM asset_refs WHERE item_id = ?1",
        params![item_id],
    )?;
    for (name, digest) in &record.assets {
        let hex = digest.to_hex();
        conn.execute(
            "INSERT INTO asset_refs (item_id, name, digest) VALUES (?1, ?2, ?3)",
            params![item_id, name, hex],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO assets (digest, present, added_at) VALUES (?1, 0, ?2)",
            params![hex, now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO asset_acls (app_id, digest) VALUES (?1, ?2)",
            params![app_id, hex],
        )?;
    }

    let ready: bool = conn.query_row(
        "SELECT assets_ready FROM item_state WHERE id = ?1",
        params![item_id],
        |row| row.get(0),
    )?;

    let mut stored = record.clone();
    stored.assets_ready = ready;
    Ok(ApplyResult::Applied(stored))
}

// Helper to convert an item_state row to a DataItemRecord. Asset
// references are filled in by a second query.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataItemRecord> {
    let host: String = row.get("host")?;
    let path: String = row.get("path")?;
    let uri = ItemUri::new(NodeId::new(host), path).map_err(|_| {
        rusqlite::Error::InvalidColumnType(4, "path".into(), rusqlite::types::Type::Text)
    })?;

    Ok(DataItemRecord {
        app: AppKey::new(
            row.get::<_, String>("package")?,
            row.get::<_, String>("signature")?,
        ),
        uri,
        payload: row.get("payload")?,
        assets: BTreeMap::new(),
        source: NodeId::new(row.get::<_, String>("source_node")?),
        seq: row.get("seq")?,
        deleted: row.get("deleted")?,
        last_modified: row.get("last_modified")?,
        assets_ready: row.get("assets_ready")?,
    })
}

/// Run an item query (selecting the `item_state` columns, `id` first) and
/// attach each row's asset references.
fn query_items(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<DataItemRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((row.get::<_, i64>("id")?, row_to_record(row)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (id, mut record) in rows {
        record.assets = load_refs(conn, id)?;
        items.push(record);
    }
    Ok(items)
}

fn load_refs(conn: &Connection, item_id: i64) -> Result<BTreeMap<String, Digest>> {
    let mut stmt = conn.prepare("SELECT name, digest FROM asset_refs WHERE item_id = ?1")?;
    let rows = stmt.query_map(params![item_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut assets = BTreeMap::new();
    for row in rows {
        let (name, hex) = row?;
        let digest = Digest::from_hex(&hex)
            .map_err(|e| StoreError::InvalidData(format!("asset ref {}: {}", name, e)))?;
        assets.insert(name, digest);
    }
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppKey {
        AppKey::new("com.example.weather", "sig-0011")
    }

    fn uri(host: &str, path: &str) -> ItemUri {
        ItemUri::new(NodeId::from(host), path).unwrap()
    }

    fn record(host: &str, path: &str, source: &str, seq: i64, payload: &[u8]) -> DataItemRecord {
        let mut r = DataItemRecord::new(app(), uri(host, path), Some(payload.to_vec()));
        r.source = NodeId::from(source);
        r.seq = seq;
        r
    }

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let ledger = Ledger::open_memory().unwrap();

        let r = record("node-a", "/weather/today", "node-a", 1, b"sunny");
        let result = ledger.put_record(&r).await.unwrap();
        assert!(result.is_applied());

        let got = ledger
            .get_item(&app(), &uri("node-a", "/weather/today"))
            .await
            .unwrap()
            .expect("item should be materialized");
        assert_eq!(got.payload.as_deref(), Some(&b"sunny"[..]));
        assert_eq!(got.source.as_str(), "node-a");
        assert_eq!(got.seq, 1);
        assert!(got.assets_ready);
        assert!(!got.deleted);
    }

    #[tokio::test]
    async fn test_put_overwrites_in_place() {
        let ledger = Ledger::open_memory().unwrap();

        ledger
            .put_record(&record("node-a", "/weather/today", "node-a", 1, b"sunny"))
            .await
            .unwrap();
        ledger
            .put_record(&record("node-a", "/weather/today", "node-a", 2, b"rain"))
            .await
            .unwrap();

        let got = ledger
            .get_item(&app(), &uri("node-a", "/weather/today"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload.as_deref(), Some(&b"rain"[..]));
        assert_eq!(got.seq, 2);

        // Only the latest state is materialized
        let all = ledger
            .modified_since(&NodeId::from("node-a"), 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].seq, 2);
    }

    #[tokio::test]
    async fn test_replay_same_seq_is_stale() {
        let ledger = Ledger::open_memory().unwrap();

        ledger
            .put_record(&record("node-a", "/k", "node-a", 5, b"v5"))
            .await
            .unwrap();

        let replay = ledger
            .put_record(&record("node-a", "/k", "node-a", 5, b"v5"))
            .await
            .unwrap();
        assert_eq!(replay, ApplyResult::Stale);

        let old = ledger
            .put_record(&record("node-a", "/k", "node-a", 3, b"v3"))
            .await
            .unwrap();
        assert_eq!(old, ApplyResult::Stale);

        let got = ledger.get_item(&app(), &uri("node-a", "/k")).await.unwrap().unwrap();
        assert_eq!(got.payload.as_deref(), Some(&b"v5"[..]));
        assert_eq!(got.seq, 5);
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_reauthors() {
        let ledger = Ledger::open_memory().unwrap();
        let local = NodeId::from("node-local");

        ledger
            .put_record(&record("node-a", "/pref/x", "node-a", 4, b"x"))
            .await
            .unwrap();
        ledger
            .put_record(&record("node-a", "/pref/y", "node-a", 5, b"y"))
            .await
            .unwrap();

        let tombstones = ledger
            .delete_items(&app(), Some(&NodeId::from("node-a")), "/pref/", true, &local)
            .await
            .unwrap();
        assert_eq!(tombstones.len(), 2);
        for t in &tombstones {
            assert!(t.deleted);
            assert!(t.payload.is_none());
            assert_eq!(t.source, local);
            assert!(t.seq >= 1);
        }

        // Deleted items no longer answer reads
        assert!(ledger
            .get_item(&app(), &uri("node-a", "/pref/x"))
            .await
            .unwrap()
            .is_none());

        // But the tombstones replicate as local mutations
        let local_items = ledger.modified_since(&local, 0).await.unwrap();
        assert_eq!(local_items.len(), 2);
        assert!(local_items.iter().all(|r| r.deleted));
    }

    #[tokio::test]
    async fn test_delete_exact_spares_longer_paths() {
        let ledger = Ledger::open_memory().unwrap();
        let local = NodeId::from("node-local");

        ledger
            .put_record(&record("node-a", "/cap/play", "node-a", 1, b"p"))
            .await
            .unwrap();
        ledger
            .put_record(&record("node-a", "/cap/playback", "node-a", 2, b"q"))
            .await
            .unwrap();

        let tombstones = ledger
            .delete_items(&app(), Some(&NodeId::from("node-a")), "/cap/play", false, &local)
            .await
            .unwrap();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].uri.path(), "/cap/play");

        // The longer path sharing the prefix is untouched
        assert!(ledger
            .get_item(&app(), &uri("node-a", "/cap/playback"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_modified_since_ascending() {
        let ledger = Ledger::open_memory().unwrap();

        for (path, seq) in [("/a", 3), ("/b", 1), ("/c", 7)] {
            ledger
                .put_record(&record("node-a", path, "node-a", seq, b"p"))
                .await
                .unwrap();
        }

        let since_one = ledger
            .modified_since(&NodeId::from("node-a"), 1)
            .await
            .unwrap();
        let seqs: Vec<i64> = since_one.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 7]);
    }

    #[tokio::test]
    async fn test_watermark() {
        let ledger = Ledger::open_memory().unwrap();
        let node = NodeId::from("node-a");

        assert_eq!(ledger.watermark(&node).await.unwrap(), 0);

        ledger
            .put_record(&record("node-a", "/a", "node-a", 9, b"p"))
            .await
            .unwrap();
        assert_eq!(ledger.watermark(&node).await.unwrap(), 9);

        let marks = ledger.source_watermarks().await.unwrap();
        assert_eq!(marks, vec![(node, 9)]);
    }

    #[tokio::test]
    async fn test_next_seq_monotonic() {
        let ledger = Ledger::open_memory().unwrap();
        assert_eq!(ledger.next_seq().await.unwrap(), 1);
        assert_eq!(ledger.next_seq().await.unwrap(), 2);
        assert_eq!(ledger.next_seq().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_readiness_requires_every_asset() {
        let ledger = Ledger::open_memory().unwrap();
        let photo = Digest::of(b"photo bytes");
        let icon = Digest::of(b"icon bytes");

        let r = record("node-a", "/gallery/1", "node-a", 1, b"meta")
            .with_asset("photo", photo)
            .with_asset("icon", icon);
        let stored = match ledger.put_record(&r).await.unwrap() {
            ApplyResult::Applied(stored) => stored,
            ApplyResult::Stale => panic!("fresh record must apply"),
        };
        assert!(!stored.assets_ready);

        // Not readable until every referenced asset is present
        assert!(ledger
            .get_item(&app(), &uri("node-a", "/gallery/1"))
            .await
            .unwrap()
            .is_none());

        assert!(ledger.mark_asset_present(&photo).await.unwrap());
        assert!(ledger.newly_ready_items(&photo).await.unwrap().is_empty());

        assert!(ledger.mark_asset_present(&icon).await.unwrap());
        let ready = ledger.newly_ready_items(&icon).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].assets_ready);
        assert_eq!(ready[0].assets.len(), 2);

        // The flip happens once; re-marking is a no-op
        assert!(!ledger.mark_asset_present(&icon).await.unwrap());

        let got = ledger
            .get_item(&app(), &uri("node-a", "/gallery/1"))
            .await
            .unwrap()
            .unwrap();
        assert!(got.assets_ready);
    }

    #[tokio::test]
    async fn test_missing_assets_only_for_live_items() {
        let ledger = Ledger::open_memory().unwrap();
        let local = NodeId::from("node-local");
        let blob = Digest::of(b"blob");

        let r = record("node-a", "/doc", "node-a", 1, b"meta").with_asset("blob", blob);
        ledger.put_record(&r).await.unwrap();

        let missing = ledger.missing_assets().await.unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, blob);
        assert_eq!(missing[0].1, app());

        // Present assets stop being missing
        ledger.mark_asset_present(&blob).await.unwrap();
        assert!(ledger.missing_assets().await.unwrap().is_empty());

        // A tombstoned item's references do not count either
        let other = Digest::of(b"other");
        let r2 = record("node-a", "/doc2", "node-a", 2, b"meta").with_asset("blob", other);
        ledger.put_record(&r2).await.unwrap();
        ledger
            .delete_items(&app(), Some(&NodeId::from("node-a")), "/doc2", false, &local)
            .await
            .unwrap();
        assert!(ledger.missing_assets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_asset_access_grants() {
        let ledger = Ledger::open_memory().unwrap();
        let blob = Digest::of(b"blob");
        let stranger = AppKey::new("com.example.other", "sig-ffee");

        let r = record("node-a", "/doc", "node-a", 1, b"meta").with_asset("blob", blob);
        ledger.put_record(&r).await.unwrap();

        // Putting an item grants its owner access to the referenced assets
        assert!(ledger.has_asset_access(&app(), &blob).await.unwrap());
        assert!(!ledger.has_asset_access(&stranger, &blob).await.unwrap());

        ledger.grant_asset_access(&stranger, &blob).await.unwrap();
        assert!(ledger.has_asset_access(&stranger, &blob).await.unwrap());

        let apps = ledger.asset_acl_apps(&blob).await.unwrap();
        assert_eq!(apps, vec![stranger, app()]);
    }

    #[tokio::test]
    async fn test_cross_source_overwrite_applies() {
        let ledger = Ledger::open_memory().unwrap();

        ledger
            .put_record(&record("node-a", "/k", "node-a", 9, b"from-a"))
            .await
            .unwrap();

        // A different node re-authoring the same item is applied regardless
        // of sequence comparison; sequences only order within one stream.
        let result = ledger
            .put_record(&record("node-a", "/k", "node-b", 2, b"from-b"))
            .await
            .unwrap();
        assert!(result.is_applied());

        let got = ledger.get_item(&app(), &uri("node-a", "/k")).await.unwrap().unwrap();
        assert_eq!(got.payload.as_deref(), Some(&b"from-b"[..]));
        assert_eq!(got.source.as_str(), "node-b");
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let ledger = Ledger::open(&path).unwrap();
            ledger
                .put_record(&record("node-a", "/k", "node-a", 1, b"v"))
                .await
                .unwrap();
            ledger.next_seq().await.unwrap();
        }

        let ledger = Ledger::open(&path).unwrap();
        let got = ledger.get_item(&app(), &uri("node-a", "/k")).await.unwrap();
        assert!(got.is_some());
        // The counter continues where it left off
        assert_eq!(ledger.next_seq().await.unwrap(), 2);
    }
}
