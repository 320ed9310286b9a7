//! The versioned collection (spec §4.6, component C6): owns one
//! collection's local and remote DAG segments, the inbound/outbound queues
//! between them, and the background merger that keeps the snapshot
//! collection consistent with the DAG's resolved heads.

use crate::dag::DagIndex;
use crate::error::DagError;
use crate::merge::{merge, MergeOptions};
use crate::oplog_resolver::apply_modifier;
use crate::revision::{DocId, OplogEntry, OplogOpKind, Perspective, RevBody, Revision, Version};
use crate::store::{ScanDirection, Store};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// What to do when [`VersionedCollection::process_queues`] hits a merge
/// conflict it can't resolve automatically.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Stop processing further documents in this pass; the conflicting
    /// heads stay unresolved and are retried on the next call.
    HaltOnConflict,
    /// Log the conflict, leave that document's heads unresolved, and keep
    /// processing the rest of the batch.
    ProceedOnError,
}

/// One fully-processed document: its merged body (`None` if tombstoned)
/// and the revision now representing it in the local DAG segment.
#[derive(Clone, Debug)]
pub struct Reconciled {
    pub id: DocId,
    pub revision: Revision,
}

fn key_of(entry: &OplogEntry) -> Option<RevBody> {
    entry.o2.clone().or_else(|| entry.o.get("_id").map(|_| entry.o.clone()))
}

fn doc_id_of(doc: &RevBody) -> Option<DocId> {
    doc.get("_id").map(|v| match v {
        serde_json::Value::String(s) => DocId::from(s.as_str()),
        other => DocId::from(other.to_string()),
    })
}

/// Owns the DAG segment and queues for a single replicated collection.
/// `S` is the abstract store backing the collection's snapshot and oplog
/// (spec §4.1); `process_queues` is the 8-step consistency pipeline that
/// drains both queues into a fully-merged, durably-written state.
pub struct VersionedCollection<S> {
    ns: String,
    store: Arc<S>,
    dag: Mutex<DagIndex>,
    pe_local: Perspective,
    merge_opts: MergeOptions,
    conflict_policy: ConflictPolicy,
    /// Remote revisions awaiting insertion, held back when their parents
    /// haven't arrived yet.
    inbound: Mutex<VecDeque<Revision>>,
    /// Append-only log of locally- and remotely-merged revisions queued for
    /// export/replication. Never drained: a revision's position is its
    /// offset, so a reconnecting export session can resume with
    /// [`Self::outbound_since`] instead of replaying from scratch or missing
    /// whatever arrived while it was disconnected.
    outbound: Mutex<Vec<Revision>>,
}

impl<S: Store> VersionedCollection<S> {
    pub fn new(ns: impl Into<String>, store: Arc<S>, pe_local: Perspective, conflict_policy: ConflictPolicy) -> Self {
        Self {
            ns: ns.into(),
            store,
            dag: Mutex::new(DagIndex::new()),
            pe_local,
            merge_opts: MergeOptions::default(),
            conflict_policy,
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
        }
    }

    pub fn with_merge_options(mut self, opts: MergeOptions) -> Self {
        self.merge_opts = opts;
        self
    }

    /// Step 1 of the pipeline: turns a freshly observed local oplog entry
    /// into a revision parented on the current local head(s), and queues it
    /// for export. Does not touch the snapshot collection — that happens in
    /// [`Self::process_queues`], which is idempotent and may be called any
    /// number of times for the same entry without double-applying it.
    pub fn save_oplog_entry(&self, entry: OplogEntry) -> Result<(), DagError> {
        let key = match key_of(&entry) {
            Some(k) => k,
            None => {
                warn!(ns = %self.ns, "oplog entry missing a resolvable key, dropping");
                return Ok(());
            }
        };
        let id = match doc_id_of(&key) {
            Some(id) => id,
            None => return Ok(()),
        };

        let mut dag = self.dag.lock();
        let parents: Vec<Version> = dag.heads(&id, &self.pe_local).into_iter().collect();

        let body = match entry.op {
            OplogOpKind::Create => return Ok(()),
            OplogOpKind::Insert => Some(entry.o.clone()),
            OplogOpKind::Delete => None,
            OplogOpKind::Update => {
                if entry.is_modifier_update() {
                    let parent_body = parents
                        .first()
                        .and_then(|p| dag.get(&id, p, &self.pe_local))
                        .and_then(|r| r.body.clone())
                        .unwrap_or_default();
                    Some(apply_modifier(&parent_body, &entry.o))
                } else {
                    Some(entry.o.clone())
                }
            }
        };

        let rev = Revision::child(id, self.pe_local.clone(), parents, body, true);
        dag.insert(rev.clone())?;
        drop(dag);
        self.outbound.lock().push(rev);
        Ok(())
    }

    /// Step for the remote side: queues a revision observed from a peer.
    /// Actual insertion happens in [`Self::process_queues`], since the
    /// revision's parents may not have arrived yet.
    pub fn save_remote_revision(&self, rev: Revision) {
        debug_assert!(!rev.pe.is_local(), "remote revisions must not carry the local perspective");
        self.inbound.lock().push_back(rev);
    }

    /// Marks a revision acknowledged once its snapshot write is confirmed.
    pub fn set_ack(&self, id: &DocId, v: &Version, pe: &Perspective) -> bool {
        self.dag.lock().mark_ack(id, v, pe)
    }

    /// The 8-step consistency pipeline, run after one or more
    /// `save_oplog_entry`/`save_remote_revision` calls:
    ///
    /// 1. Drain the inbound queue, inserting any remote revision whose
    ///    parents are already present; revisions with missing parents are
    ///    re-queued for a later pass.
    /// 2. Collect the set of document ids touched since the last pass.
    /// 3. For each id, compute its local and remote heads.
    /// 4. For ids with a single unified head, write it straight through
    ///    (no merge needed, but it still has to reach the snapshot).
    /// 5. For ids with concurrent heads, three-way-merge them pairwise.
    /// 6. On conflict, apply the configured [`ConflictPolicy`].
    /// 7. Insert each merge result into the local DAG segment and write its
    ///    body to the snapshot collection.
    /// 8. Queue the merge result for export and mark it acknowledged once
    ///    the write is confirmed.
    ///
    /// Idempotent: re-running with no new queue entries reprocesses nothing,
    /// since merge results are content-addressed and `DagIndex::insert` is a
    /// no-op on an already-known version.
    pub async fn process_queues(&self) -> Result<Vec<Reconciled>, anyhow::Error> {
        let touched = self.drain_inbound();
        let mut reconciled = Vec::new();

        for id in touched {
            match self.reconcile_one(&id).await {
                Ok(Some(r)) => reconciled.push(r),
                Ok(None) => {}
                Err(MergeConflict(id, err)) => {
                    warn!(%id, error = %err, "merge conflict");
                    match self.conflict_policy {
                        ConflictPolicy::HaltOnConflict => return Err(err),
                        ConflictPolicy::ProceedOnError => continue,
                    }
                }
            }
        }
        Ok(reconciled)
    }

    fn drain_inbound(&self) -> Vec<DocId> {
        let mut dag = self.dag.lock();
        let mut inbound = self.inbound.lock();
        let mut touched = std::collections::BTreeSet::new();
        let mut retry = VecDeque::new();
        while let Some(rev) = inbound.pop_front() {
            match dag.insert(rev.clone()) {
                Ok(()) => {
                    touched.insert(rev.id.clone());
                }
                Err(DagError::DanglingParent { .. }) => retry.push_back(rev),
                Err(other) => {
                    warn!(error = %other, "dropping unresolvable remote revision");
                }
            }
        }
        *inbound = retry;
        touched.into_iter().collect()
    }

    async fn reconcile_one(&self, id: &DocId) -> Result<Option<Reconciled>, MergeConflict> {
        let heads: Vec<(Perspective, Version)> = {
            let dag = self.dag.lock();
            let mut all = Vec::new();
            for pe in self.known_perspectives(&dag, id) {
                for v in dag.heads(id, &pe) {
                    all.push((pe.clone(), v));
                }
            }
            all
        };

        if heads.len() <= 1 {
            // No merge needed, but the lone head — local or the first-ever
            // remote revision for an id with no prior local history — still
            // has to reach the snapshot and get acknowledged.
            return self.write_through_if_solo(id).await.map_err(|e| MergeConflict(id.clone(), e));
        }

        // Fold the heads pairwise, inserting each intermediate merge result
        // into the DAG immediately so the next fold step can look it up as
        // an ordinary revision (merge() always resolves its operands by
        // looking them up in the DAG).
        let mut dag = self.dag.lock();
        let mut iter = heads.into_iter();
        let (mut pe_acc, mut v_acc) = iter.next().expect("len > 1");
        let mut rev: Option<Revision> = None;
        for (pe, v) in iter {
            let left = (&pe_acc, &v_acc);
            let right = (&pe, &v);
            let step = merge(&dag, id, &self.pe_local, left, right, &self.merge_opts)
                .map_err(|e| MergeConflict(id.clone(), e))?;
            dag.insert(step.clone()).map_err(|e| MergeConflict(id.clone(), e.into()))?;
            pe_acc = self.pe_local.clone();
            v_acc = step.v.clone();
            rev = Some(step);
        }
        drop(dag);

        let Some(rev) = rev else { return Ok(None) };

        self.write_snapshot(id, rev.body.as_ref()).await.map_err(|e| MergeConflict(id.clone(), e))?;
        self.dag.lock().mark_ack(id, &rev.v, &self.pe_local);
        self.outbound.lock().push(rev.clone());

        Ok(Some(Reconciled { id: id.clone(), revision: rev }))
    }

    async fn write_snapshot(&self, id: &DocId, body: Option<&RevBody>) -> anyhow::Result<()> {
        match body {
            Some(body) => self.store.upsert(&self.ns, body, body.clone()).await?,
            None => {
                let mut key = RevBody::new();
                key.insert("_id".into(), serde_json::json!(id.to_string()));
                self.store.delete(&self.ns, &key).await?;
            }
        }
        Ok(())
    }

    /// The perspectives known to have at least one head for `id`: local,
    /// plus whatever remote perspectives the inbound queue has introduced.
    fn known_perspectives(&self, dag: &DagIndex, id: &DocId) -> Vec<Perspective> {
        let mut out = vec![self.pe_local.clone()];
        for pe in dag.perspectives_of(id) {
            if !out.contains(&pe) {
                out.push(pe);
            }
        }
        out
    }

    /// Returns every revision queued for export at or after `offset`, where
    /// `offset` is a revision's position in the export log (the same value
    /// handed back to a peer so it can resume from here after a
    /// disconnect). `None` serves the whole log, matching the "from the
    /// beginning if absent" resume rule. An `offset` past the end of the
    /// log yields an empty slice rather than erroring, since a peer that
    /// already has everything shouldn't be treated as a protocol violation.
    pub fn outbound_since(&self, offset: Option<u64>) -> Vec<Revision> {
        let outbound = self.outbound.lock();
        let start = offset.map(|o| o as usize).unwrap_or(0).min(outbound.len());
        outbound[start..].to_vec()
    }

    /// The export log's current length, i.e. the offset a peer starting a
    /// fresh (non-resuming) session should be told to remember.
    pub fn outbound_len(&self) -> u64 {
        self.outbound.lock().len() as u64
    }

    /// Fast path for the common case where `id` has exactly one head across
    /// every known perspective: writes it straight through to the snapshot
    /// collection without needing a merge fold. Called from two places:
    /// [`Self::reconcile_one`], for a solo remote revision that arrived with
    /// no prior local history; and directly by the worker right after
    /// [`Self::save_oplog_entry`], so a purely-local edit doesn't wait on a
    /// remote revision arriving before its snapshot is durable.
    pub async fn write_through_if_solo(&self, id: &DocId) -> anyhow::Result<Option<Reconciled>> {
        let solo = {
            let dag = self.dag.lock();
            let mut heads: Vec<(Perspective, Version)> = Vec::new();
            for pe in self.known_perspectives(&dag, id) {
                for v in dag.heads(id, &pe) {
                    heads.push((pe.clone(), v));
                }
            }
            match heads.len() {
                1 => {
                    let (pe, v) = heads.into_iter().next().expect("len == 1");
                    dag.get(id, &v, &pe).cloned()
                }
                _ => None,
            }
        };
        let Some(rev) = solo else { return Ok(None) };
        if rev.ack {
            return Ok(None);
        }

        self.write_snapshot(id, rev.body.as_ref()).await?;
        self.dag.lock().mark_ack(id, &rev.v, &rev.pe);
        // Not re-queued for outbound here: `save_oplog_entry` already queued
        // this same revision when it first inserted it into the DAG; this
        // method only accounts for the snapshot write and ack it skipped.
        Ok(Some(Reconciled { id: id.clone(), revision: rev }))
    }

    /// The namespace this collection writes its snapshot to.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// `(revisions, acknowledged)` across the whole DAG segment, for
    /// `VersionedSystem::info`'s per-VC stats (spec §4.10).
    pub fn ack_stats(&self) -> (usize, usize) {
        self.dag.lock().ack_stats()
    }

    pub async fn scan_snapshot(&self, direction: ScanDirection) -> anyhow::Result<Vec<RevBody>> {
        use futures::StreamExt;
        let mut stream = self.store.scan(&self.ns, direction).await?;
        let mut out = Vec::new();
        while let Some(doc) = stream.next().await {
            out.push(doc);
        }
        Ok(out)
    }
}

struct MergeConflict(DocId, anyhow::Error);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn entry(ts: u64, op: OplogOpKind, ns: &str, o: RevBody, o2: Option<RevBody>) -> OplogEntry {
        OplogEntry { ts, op, ns: ns.to_string(), o, o2 }
    }

    fn doc(id: &str, v: u32) -> RevBody {
        let mut m = RevBody::new();
        m.insert("_id".into(), serde_json::json!(id));
        m.insert("v".into(), serde_json::json!(v));
        m
    }

    /// Like [`doc`] but adds a distinct extra field per caller, so two
    /// edits against the same base don't collide on the same key.
    fn doc_with(id: &str, v: u32, extra_key: &str, extra_val: u32) -> RevBody {
        let mut m = doc(id, v);
        m.insert(extra_key.to_string(), serde_json::json!(extra_val));
        m
    }

    #[tokio::test]
    async fn local_insert_is_written_through_on_process() {
        let store = Arc::new(MemoryStore::new());
        let vc = VersionedCollection::new("db.c", store.clone(), Perspective::local(), ConflictPolicy::HaltOnConflict);
        vc.save_oplog_entry(entry(1, OplogOpKind::Insert, "db.c", doc("a", 1), None)).unwrap();

        // A purely local insert never enters the inbound queue, so
        // process_queues's touched-id set stays empty for it; the worker
        // writes it through directly via write_through_if_solo right after
        // save_oplog_entry (see worker::apply_entry), so there's nothing for
        // process_queues to do here. Here we just assert the DAG captured
        // the insert. The remote counterpart — a solo head that *did* come
        // through the inbound queue — is covered by
        // `solo_remote_head_is_written_through_by_process_queues` below.
        let heads = vc.dag.lock().heads(&DocId::from("a"), &Perspective::local());
        assert_eq!(heads.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_heads_merge_and_write_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let pe_remote = Perspective::new("peer-1");
        let vc = VersionedCollection::new("db.c", store.clone(), Perspective::local(), ConflictPolicy::HaltOnConflict);

        let base = Revision::root(DocId::from("a"), Perspective::local(), Some(doc("a", 0)), true);
        vc.dag.lock().insert(base.clone()).unwrap();
        let mirror = Revision { pe: pe_remote.clone(), ..base.clone() };
        vc.dag.lock().insert(mirror).unwrap();

        let local_edit = Revision::child(
            DocId::from("a"),
            Perspective::local(),
            vec![base.v.clone()],
            Some(doc_with("a", 0, "tag", 1)),
            true,
        );
        vc.dag.lock().insert(local_edit).unwrap();

        let remote_edit = Revision::child(
            DocId::from("a"),
            pe_remote.clone(),
            vec![base.v.clone()],
            Some(doc_with("a", 0, "note", 2)),
            false,
        );
        vc.save_remote_revision(remote_edit);

        let reconciled = vc.process_queues().await.unwrap();
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].id, DocId::from("a"));

        let snapshot = vc.scan_snapshot(ScanDirection::Asc).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].get("tag"), Some(&serde_json::json!(1)));
        assert_eq!(snapshot[0].get("note"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn solo_remote_head_is_written_through_by_process_queues() {
        let store = Arc::new(MemoryStore::new());
        let pe_remote = Perspective::new("peer-1");
        let vc = VersionedCollection::new("db.c", store.clone(), Perspective::local(), ConflictPolicy::HaltOnConflict);

        // First revision this VC has ever seen for "a", arriving from a
        // peer with no prior local history — reconcile_one's head count is
        // 1, but it still has to land in the snapshot and get acked.
        let root = Revision::root(DocId::from("a"), pe_remote.clone(), Some(doc("a", 1)), false);
        vc.save_remote_revision(root.clone());

        let reconciled = vc.process_queues().await.unwrap();
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].id, DocId::from("a"));

        let snapshot = vc.scan_snapshot(ScanDirection::Asc).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].get("v"), Some(&serde_json::json!(1)));

        assert!(vc.dag.lock().get(&DocId::from("a"), &root.v, &pe_remote).unwrap().ack);
    }

    #[tokio::test]
    async fn outbound_since_resumes_from_a_mid_log_offset() {
        let store = Arc::new(MemoryStore::new());
        let vc = VersionedCollection::new("db.c", store.clone(), Perspective::local(), ConflictPolicy::HaltOnConflict);
        vc.save_oplog_entry(entry(1, OplogOpKind::Insert, "db.c", doc("a", 1), None)).unwrap();
        vc.save_oplog_entry(entry(2, OplogOpKind::Insert, "db.c", doc("b", 1), None)).unwrap();
        vc.save_oplog_entry(entry(3, OplogOpKind::Insert, "db.c", doc("c", 1), None)).unwrap();

        // A peer that already has the first revision resumes from offset 1
        // and only sees what was appended after it.
        let resumed = vc.outbound_since(Some(1));
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].id, DocId::from("b"));
        assert_eq!(resumed[1].id, DocId::from("c"));

        // No offset replays the whole log, matching a fresh session.
        assert_eq!(vc.outbound_since(None).len(), 3);

        // An offset past the end yields nothing rather than erroring.
        assert!(vc.outbound_since(Some(99)).is_empty());

        assert_eq!(vc.outbound_len(), 3);
    }

    #[tokio::test]
    async fn conflicting_merge_halts_when_configured() {
        let store = Arc::new(MemoryStore::new());
        let pe_remote = Perspective::new("peer-1");
        let vc = VersionedCollection::new("db.c", store.clone(), Perspective::local(), ConflictPolicy::HaltOnConflict);

        let base = Revision::root(DocId::from("a"), Perspective::local(), Some(doc("a", 0)), true);
        vc.dag.lock().insert(base.clone()).unwrap();
        let mirror = Revision { pe: pe_remote.clone(), ..base.clone() };
        vc.dag.lock().insert(mirror).unwrap();

        let local_edit = Revision::child(
            DocId::from("a"),
            Perspective::local(),
            vec![base.v.clone()],
            Some(doc("a", 1)),
            true,
        );
        vc.dag.lock().insert(local_edit).unwrap();

        let remote_edit = Revision::child(
            DocId::from("a"),
            pe_remote.clone(),
            vec![base.v.clone()],
            Some(doc("a", 2)),
            false,
        );
        vc.save_remote_revision(remote_edit);

        let result = vc.process_queues().await;
        assert!(result.is_err());
    }
}
