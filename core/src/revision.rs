//! The revision: the single node type of the per-collection DAG (spec §3).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved perspective sentinel for revisions derived from local oplog ops.
pub const LOCAL_PERSPECTIVE: &str = "_local";

/// Maximum encoded length of a [`DocId`], per spec §3.
pub const MAX_ID_BYTES: usize = 254;

/// Opaque application document identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(Vec<u8>);

impl DocId {
    /// Builds a [`DocId`], rejecting ids over the spec's 254-byte cap.
    pub fn new(bytes: impl Into<Vec<u8>>) -> anyhow::Result<Self> {
        let bytes = bytes.into();
        anyhow::ensure!(
            bytes.len() <= MAX_ID_BYTES,
            "document id exceeds {} bytes",
            MAX_ID_BYTES
        );
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "DocId({:?})", s),
            Err(_) => write!(f, "DocId({})", hex::encode(&self.0)),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{}", hex::encode(&self.0)),
        }
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

/// Opaque version token, unique within `(id, perspective)`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a content-addressed version token from the revision's identity
    /// and content, so two peers that independently observe the same
    /// mutation agree on its token without a handshake.
    pub fn derive(id: &DocId, pe: &Perspective, pa: &[Version], body: Option<&RevBody>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(id.as_bytes());
        hasher.update(pe.as_str().as_bytes());
        for p in pa {
            hasher.update(p.as_str().as_bytes());
        }
        if let Some(body) = body {
            // BTreeMap iterates in key order, so this is stable regardless of
            // construction order.
            if let Ok(bytes) = serde_json::to_vec(body) {
                hasher.update(&bytes);
            }
        }
        Self(hasher.finalize().to_hex()[..16].to_string())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The peer from which a revision is observed; [`LOCAL_PERSPECTIVE`] is reserved.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Perspective(String);

impl Perspective {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn local() -> Self {
        Self(LOCAL_PERSPECTIVE.to_string())
    }

    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_PERSPECTIVE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The document payload, an opaque JSON object. Absent for tombstones.
pub type RevBody = serde_json::Map<String, serde_json::Value>;

/// A single DAG node (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: DocId,
    pub v: Version,
    pub pe: Perspective,
    pub pa: Vec<Version>,
    /// Monotonic local sequence index; set only for `pe == _local`.
    pub i: Option<u64>,
    /// True if this revision's content was first written by a local oplog op.
    pub lo: bool,
    /// Tombstone flag.
    pub d: bool,
    /// Set once the snapshot write has been confirmed by the store.
    pub ack: bool,
    /// Oplog-offset pointer last associated with this revision.
    pub op: Option<u64>,
    pub body: Option<RevBody>,
}

impl Revision {
    /// Builds a root revision (`pa` empty) for a freshly observed document.
    pub fn root(id: DocId, pe: Perspective, body: Option<RevBody>, lo: bool) -> Self {
        let v = Version::derive(&id, &pe, &[], body.as_ref());
        Self {
            id,
            v,
            pe,
            pa: Vec::new(),
            i: None,
            lo,
            d: body.is_none(),
            ack: false,
            op: None,
            body,
        }
    }

    /// Builds a child revision parented on `pa`.
    pub fn child(
        id: DocId,
        pe: Perspective,
        pa: Vec<Version>,
        body: Option<RevBody>,
        lo: bool,
    ) -> Self {
        let v = Version::derive(&id, &pe, &pa, body.as_ref());
        Self {
            id,
            v,
            pe,
            pa,
            i: None,
            lo,
            d: body.is_none(),
            ack: false,
            op: None,
            body,
        }
    }

    pub fn is_root(&self) -> bool {
        self.pa.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.pa.len() >= 2
    }
}

/// The oplog operation code, spec §6: `op ∈ {i,u,d,c}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OplogOpKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "c")]
    Create,
}

/// An opaque oplog entry as consumed from the store's capped collection (spec §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OplogEntry {
    /// Monotonic 64-bit commit offset.
    pub ts: u64,
    pub op: OplogOpKind,
    /// `"db.collection"`.
    pub ns: String,
    /// The document, or the `$set`/`$unset` modifier for updates.
    pub o: RevBody,
    /// Key selector for updates/deletes.
    pub o2: Option<RevBody>,
}

impl OplogEntry {
    /// An update entry is a "full" replacement unless `o` is a modifier
    /// (carries `$set`/`$unset` keys), matching spec §4.6's classification.
    pub fn is_modifier_update(&self) -> bool {
        self.op == OplogOpKind::Update && (self.o.contains_key("$set") || self.o.contains_key("$unset"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_rejects_oversized() {
        let big = vec![0u8; MAX_ID_BYTES + 1];
        assert!(DocId::new(big).is_err());
    }

    #[test]
    fn version_derive_is_deterministic() {
        let id = DocId::from("X");
        let pe = Perspective::local();
        let v1 = Version::derive(&id, &pe, &[], None);
        let v2 = Version::derive(&id, &pe, &[], None);
        assert_eq!(v1, v2);
    }

    #[test]
    fn version_derive_distinguishes_body() {
        let id = DocId::from("X");
        let pe = Perspective::local();
        let mut body = RevBody::new();
        body.insert("a".into(), serde_json::json!("b"));
        let v1 = Version::derive(&id, &pe, &[], None);
        let v2 = Version::derive(&id, &pe, &[], Some(&body));
        assert_ne!(v1, v2);
    }
}
