//! Error taxonomy for the DAG store, merge engine and oplog machinery.
//!
//! Mirrors spec §7: each bullet in the "DAG integrity", "Store" and "Merge"
//! categories gets its own variant so callers can match on cause rather than
//! stringly-typed messages, with `anyhow` used at the public API boundary.

use crate::revision::{DocId, Perspective, Version};
use thiserror::Error;

/// Failures from the DAG index and LCA finder (spec §4.3, §4.4).
#[derive(Debug, Error)]
pub enum DagError {
    #[error("dangling parent {parent} for revision {id:?}/{version}@{pe}")]
    DanglingParent {
        id: DocId,
        version: Version,
        pe: Perspective,
        parent: Version,
    },

    #[error("revision {0} has {1} parents, which violates the arity expected for this operation")]
    ArityViolation(Version, usize),

    #[error("ancestor {version} of {id:?} is missing perspective {missing} (needed {pe_x} and {pe_y})")]
    MissingPerspective {
        id: DocId,
        version: Version,
        missing: Perspective,
        pe_x: Perspective,
        pe_y: Perspective,
    },

    #[error("revision {0} is a corrupt tombstone (body present alongside d=true)")]
    CorruptTombstone(Version),

    #[error("LCA operands disagree on id: {0:?} vs {1:?}")]
    DifferentIds(DocId, DocId),

    #[error("corrupt DAG: {0}")]
    CorruptDag(String),
}

/// Failures from the three-way merger (spec §4.5).
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("conflicting keys: {0:?}")]
    Conflict(Vec<String>),

    #[error("two successive merge attempts failed to reduce the head count for {0:?}")]
    MultiHeadLoop(DocId),
}

/// Failures from the abstract store adapter (spec §4.1, §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("write to {0} was not acknowledged")]
    WriteNotAcknowledged(String),

    #[error("capped collection {0} evicted revision {1} which is still needed")]
    EvictedStillNeeded(String, String),

    #[error("store unavailable, retry: {0}")]
    Transient(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration errors surfaced while parsing replication rules (spec §4.9, §7).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field `size` for collection {0}")]
    MissingSize(String),

    #[error("missing db/collection in rule")]
    MissingNamespace,

    #[error("bidirectional replication rejected for {0} <-> {1}")]
    Bidirectional(String, String),

    #[error("unknown hook: {0}")]
    UnknownHook(String),

    #[error("import for {db}.{coll} has no matching export rule at {peer}")]
    MissingExport {
        db: String,
        coll: String,
        peer: String,
    },
}
