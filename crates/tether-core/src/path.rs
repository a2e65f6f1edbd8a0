//! Item URIs.
//!
//! A data item lives at `tether://<host>/<path>`: the host component names
//! the node that authored the item, the path is chosen by the owning
//! application. The path always begins with `/`.

use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};
use crate::types::NodeId;

pub const URI_SCHEME: &str = "tether";

/// Host-qualified location of a data item.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemUri {
    host: NodeId,
    path: String,
}

impl ItemUri {
    /// Build a uri from a host node and an absolute path.
    pub fn new(host: NodeId, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self { host, path })
    }

    pub fn host(&self) -> &NodeId {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolve a possibly-relative host component against the local node.
    ///
    /// An empty host or the literal `"local"` refers to the local node;
    /// anything else is taken verbatim.
    pub fn fix_host(host: &str, local: &NodeId) -> NodeId {
        if host.is_empty() || host == "local" {
            local.clone()
        } else {
            NodeId::from(host)
        }
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(CoreError::InvalidPath(format!(
            "path must be absolute: {path:?}"
        )));
    }
    if path.contains('\0') {
        return Err(CoreError::InvalidPath("path contains NUL".to_string()));
    }
    Ok(())
}

impl fmt::Display for ItemUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", URI_SCHEME, self.host, self.path)
    }
}

impl fmt::Debug for ItemUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemUri({self})")
    }
}

impl FromStr for ItemUri {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(URI_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| CoreError::InvalidUri(format!("missing {URI_SCHEME}:// scheme: {s:?}")))?;
        let slash = rest
            .find('/')
            .ok_or_else(|| CoreError::InvalidUri(format!("missing path: {s:?}")))?;
        let (host, path) = rest.split_at(slash);
        if host.is_empty() {
            return Err(CoreError::InvalidUri(format!("missing host: {s:?}")));
        }
        Self::new(NodeId::from(host), path)
    }
}
