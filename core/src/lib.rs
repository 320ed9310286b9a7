//! The versioned-collection engine: a content-addressed, multi-perspective
//! revision DAG with LCA discovery, three-way merge, a virtual stream over
//! persisted and in-memory state, and the oplog plumbing that keeps a
//! replicated snapshot collection consistent (spec §3–§4.8).
//!
//! [`vc::VersionedCollection`] is the façade most callers want; the other
//! modules are its building blocks, exposed so they can be tested and
//! composed independently.

pub mod dag;
pub mod error;
pub mod lca;
pub mod merge;
pub mod oplog_reader;
pub mod oplog_resolver;
pub mod revision;
pub mod store;
pub mod vc;
pub mod vstream;

pub use dag::DagIndex;
pub use error::{ConfigError, DagError, MergeError, StoreError};
pub use lca::{find_lca, LcaOperand};
pub use merge::{merge, MergeHook, MergeOptions, TombstonePolicy};
pub use oplog_reader::{OplogReader, OplogReaderOptions};
pub use oplog_resolver::{resolve as resolve_oplog_offset, resolve_slice, ResolveOutcome};
pub use revision::{DocId, OplogEntry, OplogOpKind, Perspective, RevBody, Revision, Version, LOCAL_PERSPECTIVE};
pub use store::{CappedHandle, MemoryStore, ScanDirection, Store};
#[cfg(feature = "sled-store")]
pub use store::SledStore;
pub use vc::{ConflictPolicy, Reconciled, VersionedCollection};
pub use vstream::{Direction as StreamDirection, Mode as StreamMode, VStreamError, VirtualStream};
