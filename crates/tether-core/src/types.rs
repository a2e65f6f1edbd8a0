//! Identities shared across the data layer.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque identifier for a device participating in sync.
///
/// Node ids are stable strings, UUID-shaped in practice. One node is
/// "local"; everything else is a peer. The reserved `"cloud"` key appears
/// only in sync tables, never as a connected peer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved sync-table placeholder key.
    pub fn cloud() -> Self {
        Self("cloud".to_string())
    }

    pub fn is_cloud(&self) -> bool {
        self.0 == "cloud"
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Generate a fresh random node id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The identity of an owning application: package name plus the digest of
/// its signing certificate. Both are opaque strings supplied by the
/// platform; the data layer only ever compares them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppKey {
    pub package: String,
    pub signature: String,
}

impl AppKey {
    pub fn new(package: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            signature: signature.into(),
        }
    }
}

impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppKey({})", self.package)
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.package)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Advisory only: nothing in the sync protocol resolves conflicts by
/// timestamp.
pub fn now_millis() -> i64 {
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
    fn test_cloud_key() {
        assert!(NodeId::cloud().is_cloud());
        assert!(!NodeId::from("node-a").is_cloud());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(NodeId::generate(), NodeId::generate());
    }

    #[test]
    fn test_app_key_equality() {
        let a = AppKey::new("com.example.app", "sig1");
        let b = AppKey::new("com.example.app", "sig1");
        let c = AppKey::new("com.example.app", "sig2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
