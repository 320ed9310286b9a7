//! In-memory reference [`Store`] implementation, used by tests and by
//! [`crate::vc::VersionedCollection`] doctests. Not durable.

use super::{CappedHandle, DocStream, EntryStream, ScanDirection, Store};
use crate::error::StoreError;
use crate::revision::{OplogEntry, RevBody};
use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

struct Capped {
    entries: Vec<OplogEntry>,
    size_bytes: u64,
    cap_bytes: u64,
    notify: Arc<Notify>,
}

impl Capped {
    fn new(cap_bytes: u64) -> Self {
        Self {
            entries: Vec::new(),
            size_bytes: 0,
            cap_bytes,
            notify: Arc::new(Notify::new()),
        }
    }

    fn approx_size(entry: &OplogEntry) -> u64 {
        serde_json::to_vec(entry).map(|b| b.len() as u64).unwrap_or(64)
    }

    fn push(&mut self, entry: OplogEntry) {
        self.size_bytes += Self::approx_size(&entry);
        self.entries.push(entry);
        while self.size_bytes > self.cap_bytes && self.entries.len() > 1 {
            let evicted = self.entries.remove(0);
            self.size_bytes = self.size_bytes.saturating_sub(Self::approx_size(&evicted));
        }
        self.notify.notify_waiters();
    }
}

fn doc_key(doc: &RevBody) -> Result<String, StoreError> {
    doc.get("_id")
        .map(|v| v.to_string())
        .ok_or_else(|| StoreError::Transient("document missing `_id`".into()))
}

/// A purely in-process [`Store`]: namespaces are `BTreeMap`s keyed by the
/// document's `_id` field, capped collections are `Vec`s with byte-budget
/// eviction and a [`Notify`] to wake tailers.
///
/// The capped-collection table is held behind its own `Arc<Mutex<_>>` (not
/// borrowed from `&self`) so [`Store::tail`]'s `'static` stream can share it
/// directly instead of cloning the whole store.
#[derive(Clone)]
pub struct MemoryStore {
    namespaces: Arc<Mutex<HashMap<String, BTreeMap<String, RevBody>>>>,
    capped: Arc<Mutex<HashMap<String, Capped>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            namespaces: Arc::new(Mutex::new(HashMap::new())),
            capped: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn open_capped(&self, name: &str, size_bytes: u64) -> Result<CappedHandle, StoreError> {
        self.capped
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Capped::new(size_bytes));
        Ok(CappedHandle { name: name.to_string() })
    }

    async fn append(&self, handle: &CappedHandle, entry: OplogEntry) -> Result<(), StoreError> {
        let mut capped = self.capped.lock();
        let c = capped
            .get_mut(&handle.name)
            .ok_or_else(|| StoreError::NamespaceNotFound(handle.name.clone()))?;
        c.push(entry);
        Ok(())
    }

    fn tail(&self, handle: &CappedHandle, from_offset: u64, include_offset: bool) -> EntryStream {
        let name = handle.name.clone();
        let notify = self
            .capped
            .lock()
            .entry(name.clone())
            .or_insert_with(|| Capped::new(u64::MAX))
            .notify
            .clone();
        let capped = self.capped.clone();
        Box::pin(stream::unfold(
            (capped, name, from_offset, include_offset, notify, false),
            move |(capped, name, offset, include, notify, already_yielded)| async move {
                loop {
                    let next = {
                        let guard = capped.lock();
                        let c = guard.get(&name)?;
                        c.entries
                            .iter()
                            .find(|e| {
                                if include && !already_yielded {
                                    e.ts >= offset
                                } else {
                                    e.ts > offset
                                }
                            })
                            .cloned()
                    };
                    if let Some(entry) = next {
                        let next_offset = entry.ts;
                        return Some((entry, (capped, name, next_offset, include, notify, true)));
                    }
                    notify.notified().await;
                }
            },
        ))
    }

    async fn create_index(&self, _ns: &str, _fields: &[&str]) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put(&self, ns: &str, doc: RevBody) -> Result<(), StoreError> {
        let key = doc_key(&doc)?;
        let mut namespaces = self.namespaces.lock();
        let coll = namespaces.entry(ns.to_string()).or_default();
        coll.insert(key, doc);
        Ok(())
    }

    async fn upsert(&self, ns: &str, key: &RevBody, doc: RevBody) -> Result<(), StoreError> {
        let key = doc_key(key)?;
        let mut namespaces = self.namespaces.lock();
        let coll = namespaces.entry(ns.to_string()).or_default();
        coll.insert(key, doc);
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &RevBody) -> Result<(), StoreError> {
        let key = doc_key(key)?;
        let mut namespaces = self.namespaces.lock();
        if let Some(coll) = namespaces.get_mut(ns) {
            coll.remove(&key);
        }
        Ok(())
    }

    async fn get(&self, ns: &str, key: &RevBody) -> Result<Option<RevBody>, StoreError> {
        let key = doc_key(key)?;
        let namespaces = self.namespaces.lock();
        Ok(namespaces.get(ns).and_then(|coll| coll.get(&key)).cloned())
    }

    async fn scan(&self, ns: &str, direction: ScanDirection) -> Result<DocStream, StoreError> {
        let namespaces = self.namespaces.lock();
        let mut docs: Vec<RevBody> = namespaces
            .get(ns)
            .map(|coll| coll.values().cloned().collect())
            .unwrap_or_default();
        if direction == ScanDirection::Desc {
            docs.reverse();
        }
        Ok(Box::pin(stream::iter(docs)))
    }
}
