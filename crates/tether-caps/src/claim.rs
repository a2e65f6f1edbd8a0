//! Capability claims.
//!
//! A capability is a named feature a node advertises. Claims ride the
//! normal data-item sync path: each claim is a data item at
//! `/capabilities/<percent-encoded name>`, hosted by the claiming node and
//! owned by the claiming application, with the claim kind in the payload's
//! first byte. Tombstoning the item withdraws the claim.

use tether_core::{AppKey, DataItemRecord, ItemUri, NodeId};

use crate::error::{CapsError, Result};

/// Reserved path prefix for capability claims.
pub const CAPABILITY_PREFIX: &str = "/capabilities/";

/// How a capability was claimed, carried as the claim payload's first
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// Declared ahead of time; a static claim is final and cannot be
    /// re-claimed.
    Static = 0,

    /// Added at runtime; may later be upgraded to static.
    Dynamic = 1,
}

impl ClaimKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ClaimKind::Static),
            1 => Some(ClaimKind::Dynamic),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A live capability claim held by some node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub name: String,
    pub node: NodeId,
    pub app: AppKey,
    pub kind: ClaimKind,
}

impl Claim {
    /// Read a claim out of its data item. Returns `None` for tombstones,
    /// items outside the reserved prefix, and malformed claim payloads.
    pub fn from_record(record: &DataItemRecord) -> Option<Claim> {
        if record.deleted {
            return None;
        }
        let name = capability_name(record.uri.path())?;
        let kind = record
            .payload
            .as_deref()
            .and_then(|p| p.first().copied())
            .and_then(ClaimKind::from_byte)?;

        Some(Claim {
            name,
            node: record.uri.host().clone(),
            app: record.app.clone(),
            kind,
        })
    }
}

/// The item path claiming `name`.
pub fn capability_path(name: &str) -> String {
    format!("{}{}", CAPABILITY_PREFIX, encode(name))
}

/// The capability name a claim path encodes, if `path` is one.
pub fn capability_name(path: &str) -> Option<String> {
    let rest = path.strip_prefix(CAPABILITY_PREFIX)?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    decode(rest)
}

/// Whether a new claim may be written over `existing`.
///
/// A static claim is final; a dynamic claim may be upgraded to static but
/// not re-added as dynamic.
pub fn check_add(name: &str, existing: Option<ClaimKind>, requested: ClaimKind) -> Result<()> {
    match existing {
        None => Ok(()),
        Some(ClaimKind::Dynamic) if requested == ClaimKind::Static => Ok(()),
        Some(_) => Err(CapsError::DuplicateCapability(name.to_string())),
    }
}

/// Whether a claim exists to withdraw.
pub fn check_remove(name: &str, existing: Option<ClaimKind>) -> Result<()> {
    match existing {
        Some(_) => Ok(()),
        None => Err(CapsError::UnknownCapability(name.to_string())),
    }
}

/// Build the claim data item for (`app`, `name`) hosted by `node`.
pub fn claim_record(
    app: AppKey,
    node: NodeId,
    name: &str,
    kind: ClaimKind,
) -> Result<DataItemRecord> {
    let uri = ItemUri::new(node, capability_path(name))?;
    Ok(DataItemRecord::new(app, uri, Some(vec![kind.as_byte()])))
}

/// Minimal percent-encoding so arbitrary capability names stay one path
/// segment.
fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len() * 2);
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            _ => {
                out.push('%');
                out.push(char::from(b"0123456789ABCDEF"[(b >> 4) as usize]));
                out.push(char::from(b"0123456789ABCDEF"[(b & 0x0F) as usize]));
            }
        }
    }
    out
}

fn decode(encoded: &str) -> Option<String> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut bytes = encoded.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = hex_val(bytes.next()?)?;
            let lo = hex_val(bytes.next()?)?;
            out.push((hi << 4) | lo);
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}
