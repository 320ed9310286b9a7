//! The abstract store adapter (spec §4.1, component C1).
//!
//! This is the one seam spec.md explicitly pushes out of scope ("the
//! underlying storage engine ... is consumed as an abstract Store
//! interface"). [`memory`] and [`sled_store`] are reference implementations
//! good enough to drive the rest of the workspace and its tests; a
//! production deployment is expected to bring its own.

mod memory;
#[cfg(feature = "sled-store")]
mod sled_store;

pub use memory::MemoryStore;
#[cfg(feature = "sled-store")]
pub use sled_store::SledStore;

use crate::error::StoreError;
use crate::revision::{OplogEntry, RevBody};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// A stream of oplog entries in commit order. Per spec §4.1 it never
/// terminates on its own while the underlying cursor is tailable; it only
/// yields `None` if the store adapter itself is torn down.
pub type EntryStream = Pin<Box<dyn Stream<Item = OplogEntry> + Send>>;

/// A stream of persisted documents in key order, used by [`crate::vstream`]'s
/// persisted cursor `P`.
pub type DocStream = Pin<Box<dyn Stream<Item = RevBody> + Send>>;

/// Handle to an idempotently-opened capped, tailable collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CappedHandle {
    pub name: String,
}

/// Ordering direction for a [`Store::scan`], matching [`crate::vstream`]'s
/// `asc|desc` direction flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Asc,
    Desc,
}

/// Abstract durable collections plus a capped, tailable oplog feed (spec §4.1).
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens (or reuses) a capped collection of the given byte size.
    async fn open_capped(&self, name: &str, size_bytes: u64) -> Result<CappedHandle, StoreError>;

    /// Appends an entry to a capped collection, used by reference stores and
    /// test harnesses to simulate externally-observed mutations; a real
    /// store would never expose this; its oplog already exists.
    async fn append(&self, handle: &CappedHandle, entry: OplogEntry) -> Result<(), StoreError>;

    /// Tails `handle` from `from_offset`. `include_offset=false` (the
    /// default per spec §4.7) skips the entry whose offset equals
    /// `from_offset`. Never returns EOF while the cursor is valid.
    fn tail(&self, handle: &CappedHandle, from_offset: u64, include_offset: bool) -> EntryStream;

    /// Creates an index on `ns` over the given field names, best-effort.
    async fn create_index(&self, ns: &str, fields: &[&str]) -> Result<(), StoreError>;

    /// Inserts a new document, failing if the namespace enforces uniqueness
    /// and the document already exists.
    async fn put(&self, ns: &str, doc: RevBody) -> Result<(), StoreError>;

    /// Inserts or replaces the document identified by `key`.
    async fn upsert(&self, ns: &str, key: &RevBody, doc: RevBody) -> Result<(), StoreError>;

    /// Deletes the document identified by `key`. Idempotent: deleting an
    /// absent document is not an error (spec §7, "namespace not found ...
    /// idempotently ignored on drop/clear").
    async fn delete(&self, ns: &str, key: &RevBody) -> Result<(), StoreError>;

    /// Point lookup by key.
    async fn get(&self, ns: &str, key: &RevBody) -> Result<Option<RevBody>, StoreError>;

    /// Ordered scan of `ns`, the persisted cursor `P` fed into
    /// [`crate::vstream::VirtualStream`].
    async fn scan(&self, ns: &str, direction: ScanDirection) -> Result<DocStream, StoreError>;
}
