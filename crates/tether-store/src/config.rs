//! Persisted connection configurations.
//!
//! One row per known peer endpoint. The connection supervisor scans the
//! enabled dialer rows on its periodic tick; the peer's node id is written
//! back after each completed handshake.

use rusqlite::params;

use tether_core::{now_millis, NodeId};

use crate::error::Result;
use crate::ledger::Ledger;

/// Whether we dial out to this peer or expect it to dial us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRole {
    Dialer = 1,
    Listener = 2,
}

impl ConfigRole {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(ConfigRole::Dialer),
            2 => Some(ConfigRole::Listener),
            _ => None,
        }
    }
}

/// A known peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Unique configuration name.
    pub name: String,

    /// Transport kind understood by the transport provider ("tcp",
    /// "memory").
    pub kind: String,

    /// Transport-specific peer address.
    pub address: String,

    pub role: ConfigRole,
    pub enabled: bool,

    /// The peer's node id, empty until a handshake has completed.
    pub node_id: NodeId,

    /// Wall-clock ms of the last completed handshake, 0 if never.
    pub last_connected: i64,
}

impl ConnectionConfig {
    /// A new enabled dialer configuration.
    pub fn dialer(
        name: impl Into<String>,
        kind: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            address: address.into(),
            role: ConfigRole::Dialer,
            enabled: true,
            node_id: NodeId::new(""),
            last_connected: 0,
        }
    }

    /// A new enabled listener configuration.
    pub fn listener(
        name: impl Into<String>,
        kind: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            role: ConfigRole::Listener,
            ..Self::dialer(name, kind, address)
        }
    }
}

impl Ledger {
    /// Insert or replace the configuration row named `config.name`.
    pub async fn upsert_config(&self, config: &ConnectionConfig) -> Result<()> {
        let config = config.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO connection_configs
                     (name, kind, address, role, enabled, node_id, last_connected)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    config.name,
                    config.kind,
                    config.address,
                    config.role as i64,
                    config.enabled,
                    config.node_id.as_str(),
                    config.last_connected,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// One configuration by name.
    pub async fn config(&self, name: &str) -> Result<Option<ConnectionConfig>> {
        let name = name.to_string();

        self.with_conn(move |conn| {
            use rusqlite::OptionalExtension;

            conn.query_row(
                "SELECT name, kind, address, role, enabled, node_id, last_connected
                 FROM connection_configs WHERE name = ?1",
                params![name],
                row_to_config,
            )
            .optional()
            .map_err(crate::error::StoreError::from)
        })
        .await
    }

    /// Every known configuration, ordered by name.
    pub async fn configs(&self) -> Result<Vec<ConnectionConfig>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, kind, address, role, enabled, node_id, last_connected
                 FROM connection_configs ORDER BY name",
            )?;
            let configs = stmt
                .query_map([], row_to_config)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(configs)
        })
        .await
    }

    /// The reconnect scan's working set: enabled dialer configurations.
    pub async fn enabled_dialers(&self) -> Result<Vec<ConnectionConfig>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, kind, address, role, enabled, node_id, last_connected
                 FROM connection_configs
                 WHERE enabled = 1 AND role = 1
                 ORDER BY name",
            )?;
            let configs = stmt
                .query_map([], row_to_config)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(configs)
        })
        .await
    }

    /// Enable or disable a configuration. Returns false when no such row
    /// exists.
    pub async fn set_config_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let name = name.to_string();

        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE connection_configs SET enabled = ?2 WHERE name = ?1",
                params![name, enabled],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Remove a configuration. Returns false when no such row exists.
    pub async fn delete_config(&self, name: &str) -> Result<bool> {
        let name = name.to_string();

        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM connection_configs WHERE name = ?1",
                params![name],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Record a completed handshake against a configuration: the peer's
    /// node id and the time.
    pub async fn record_connected(&self, name: &str, node: &NodeId) -> Result<()> {
        let name = name.to_string();
        let node = node.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE connection_configs SET node_id = ?2, last_connected = ?3 WHERE name = ?1",
                params![name, node.as_str(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionConfig> {
    let role: i64 = row.get("role")?;
    let role = ConfigRole::from_i64(role).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(3, "role".into(), rusqlite::types::Type::Integer)
    })?;

    Ok(ConnectionConfig {
        name: row.get("name")?,
        kind: row.get("kind")?,
        address: row.get("address")?,
        role,
        enabled: row.get("enabled")?,
        node_id: NodeId::new(row.get::<_, String>("node_id")?),
        last_connected: row.get("last_connected")?,
    })
}
