//! The DAG index (spec §4.3, component C3): persists revisions and answers
//! `get`/`heads`/`ancestors_desc` queries.

use crate::error::DagError;
use crate::revision::{DocId, Perspective, Revision, Version};
use futures::stream::{self, Stream};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::pin::Pin;

type Key = (DocId, Perspective, Version);

/// In-memory revision graph, one instance per [`crate::vc::VersionedCollection`].
///
/// Heads are tracked incrementally rather than recomputed by scanning, so
/// `heads()` is O(1) amortized; the bucketing is keyed on `id` first so a
/// caller iterating all heads of a collection sees them in ascending id
/// order, per spec §4.3.
#[derive(Default)]
pub struct DagIndex {
    revisions: HashMap<Key, Revision>,
    /// `(id, pe, parent) -> children`, used to detect heads incrementally.
    children: HashMap<Key, BTreeSet<Version>>,
    /// `id -> pe -> head versions` (no children in that subgraph).
    heads: BTreeMap<DocId, HashMap<Perspective, BTreeSet<Version>>>,
}

impl DagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(id: &DocId, pe: &Perspective, v: &Version) -> Key {
        (id.clone(), pe.clone(), v.clone())
    }

    /// Inserts `rev`, enforcing invariant 1 (parents resolve in the same
    /// `(id, pe)` subgraph). Idempotent: re-inserting an identical revision
    /// is a no-op.
    pub fn insert(&mut self, rev: Revision) -> Result<(), DagError> {
        let key = Self::key(&rev.id, &rev.pe, &rev.v);
        if self.revisions.contains_key(&key) {
            return Ok(());
        }
        for parent in &rev.pa {
            let pkey = Self::key(&rev.id, &rev.pe, parent);
            if !self.revisions.contains_key(&pkey) {
                return Err(DagError::DanglingParent {
                    id: rev.id.clone(),
                    version: rev.v.clone(),
                    pe: rev.pe.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let heads_for_pe = self
            .heads
            .entry(rev.id.clone())
            .or_default()
            .entry(rev.pe.clone())
            .or_default();
        for parent in &rev.pa {
            heads_for_pe.remove(parent);
            self.children
                .entry(Self::key(&rev.id, &rev.pe, parent))
                .or_default()
                .insert(rev.v.clone());
        }
        heads_for_pe.insert(rev.v.clone());

        self.revisions.insert(key, rev);
        Ok(())
    }

    pub fn get(&self, id: &DocId, v: &Version, pe: &Perspective) -> Option<&Revision> {
        self.revisions.get(&Self::key(id, pe, v))
    }

    pub fn contains(&self, id: &DocId, v: &Version, pe: &Perspective) -> bool {
        self.revisions.contains_key(&Self::key(id, pe, v))
    }

    /// Marks a revision as acknowledged by the store (spec §3's `ack` flag),
    /// once its effect has been durably written to the snapshot collection.
    pub fn mark_ack(&mut self, id: &DocId, v: &Version, pe: &Perspective) -> bool {
        match self.revisions.get_mut(&Self::key(id, pe, v)) {
            Some(rev) => {
                rev.ack = true;
                true
            }
            None => false,
        }
    }

    /// Revisions with no children in the `(id, pe)` subgraph.
    pub fn heads(&self, id: &DocId, pe: &Perspective) -> BTreeSet<Version> {
        self.heads
            .get(id)
            .and_then(|by_pe| by_pe.get(pe))
            .cloned()
            .unwrap_or_default()
    }

    /// All ids that have at least one revision, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &DocId> {
        self.heads.keys()
    }

    /// Total revisions recorded, and how many carry `ack == true` — the raw
    /// counts behind the versioned system's `info()` stats (spec §4.10).
    pub fn ack_stats(&self) -> (usize, usize) {
        let total = self.revisions.len();
        let acked = self.revisions.values().filter(|r| r.ack).count();
        (total, acked)
    }

    /// Perspectives that have recorded at least one head for `id`.
    pub fn perspectives_of(&self, id: &DocId) -> Vec<Perspective> {
        self.heads
            .get(id)
            .map(|by_pe| by_pe.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest-to-oldest ancestors of `v` (including `v`), a reverse
    /// topological walk. Ties between siblings reachable via different
    /// merge parents are broken by parent-list order, so results are
    /// deterministic given identical DAGs.
    pub fn ancestors_desc(
        &self,
        id: &DocId,
        v: &Version,
        pe: &Perspective,
    ) -> Pin<Box<dyn Stream<Item = Revision> + Send + 'static>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut frontier = vec![v.clone()];
        while let Some(version) = frontier.pop() {
            if !seen.insert(version.clone()) {
                continue;
            }
            if let Some(rev) = self.get(id, &version, pe) {
                out.push(rev.clone());
                for parent in rev.pa.iter().rev() {
                    frontier.push(parent.clone());
                }
            }
        }
        Box::pin(stream::iter(out))
    }

    /// Synchronous variant of [`Self::ancestors_desc`] for algorithms (LCA,
    /// merge) that need the whole set and never suspend.
    pub fn ancestor_set(&self, id: &DocId, v: &Version, pe: &Perspective) -> HashSet<Version> {
        let mut seen = HashSet::new();
        let mut frontier = vec![v.clone()];
        while let Some(version) = frontier.pop() {
            if !seen.insert(version.clone()) {
                continue;
            }
            if let Some(rev) = self.get(id, &version, pe) {
                frontier.extend(rev.pa.iter().cloned());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::RevBody;

    fn body(n: u32) -> RevBody {
        let mut m = RevBody::new();
        m.insert("n".into(), serde_json::json!(n));
        m
    }

    #[test]
    fn single_head_after_chain() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let a = Revision::root(id.clone(), pe.clone(), Some(body(0)), true);
        let b = Revision::child(id.clone(), pe.clone(), vec![a.v.clone()], Some(body(1)), true);
        dag.insert(a.clone()).unwrap();
        dag.insert(b.clone()).unwrap();
        assert_eq!(dag.heads(&id, &pe), [b.v].into_iter().collect());
    }

    #[test]
    fn fork_produces_two_heads() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let a = Revision::root(id.clone(), pe.clone(), Some(body(0)), true);
        let b = Revision::child(id.clone(), pe.clone(), vec![a.v.clone()], Some(body(1)), true);
        let c = Revision::child(id.clone(), pe.clone(), vec![a.v.clone()], Some(body(2)), true);
        dag.insert(a).unwrap();
        dag.insert(b.clone()).unwrap();
        dag.insert(c.clone()).unwrap();
        let heads = dag.heads(&id, &pe);
        assert_eq!(heads.len(), 2);
        assert!(heads.contains(&b.v) && heads.contains(&c.v));
    }

    #[test]
    fn dangling_parent_is_rejected() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let orphan = Revision::child(
            id,
            pe,
            vec![Version::new("does-not-exist")],
            Some(body(0)),
            true,
        );
        assert!(matches!(dag.insert(orphan), Err(DagError::DanglingParent { .. })));
    }
}
