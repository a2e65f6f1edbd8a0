//! Event-delivery gating during a node-identity migration.
//!
//! While a node's identity is being migrated, data-changed delivery is
//! gated per (application, source node): a denylist suppresses named
//! applications outright, and once any application is marked migrated,
//! only the marked ones receive events. Deliveries are read-locked (many
//! concurrent readers); the rare state changes take the write lock.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tether_core::{AppKey, NodeId};

/// Per-node migration bookkeeping.
#[derive(Debug, Default)]
struct NodeMigration {
    completed: HashSet<AppKey>,
    denylist: HashSet<AppKey>,
}

/// Read-mostly gate consulted on every data-changed delivery.
#[derive(Debug, Default)]
pub struct MigrationGate {
    nodes: RwLock<HashMap<NodeId, NodeMigration>>,
}

impl MigrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    // Writers only perform single-step inserts and removes, so the map
    // stays usable after a panicked writer.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, NodeMigration>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, NodeMigration>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install empty migration state for `node`, opening its migration
    /// window.
    pub fn begin_migration(&self, node: &NodeId) {
        self.write().entry(node.clone()).or_default();
    }

    /// Suppress deliveries for `app` from `node` for the rest of the
    /// window.
    pub fn deny_package(&self, node: &NodeId, app: &AppKey) {
        self.write()
            .entry(node.clone())
            .or_default()
            .denylist
            .insert(app.clone());
    }

    /// Mark `app` as migrated for `node`; from now on only marked
    /// applications receive events from that node.
    pub fn mark_package_migrated(&self, node: &NodeId, app: &AppKey) {
        self.write()
            .entry(node.clone())
            .or_default()
            .completed
            .insert(app.clone());
    }

    /// End `node`'s migration window, clearing its completed set and
    /// denylist.
    pub fn mark_node_migration_completed(&self, node: &NodeId) {
        self.write().remove(node);
    }

    /// Whether data-changed events for (`app`, `source`) should be
    /// delivered right now.
    pub fn should_deliver_events(&self, app: &AppKey, source: &NodeId) -> bool {
        let nodes = self.read();
        match nodes.get(source) {
            None => true,
            Some(state) => {
                if state.denylist.contains(app) {
                    return false;
                }
                state.completed.is_empty() || state.completed.contains(app)
            }
        }
    }
}
