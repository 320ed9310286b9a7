//! Multi-parent, multi-perspective LCA finder (spec §4.4, component C4).

use crate::dag::DagIndex;
use crate::error::DagError;
use crate::revision::{DocId, Perspective, Version};
use std::collections::{HashMap, VecDeque};

/// One side of an LCA query. `parents` lets callers pass a virtual (not yet
/// persisted) merge candidate — its own ancestors still have to be
/// persisted, but the candidate itself doesn't.
#[derive(Clone, Debug)]
pub struct LcaOperand {
    pub id: DocId,
    pub pe: Perspective,
    pub version: Version,
    pub parents: Vec<Version>,
}

impl LcaOperand {
    /// Builds an operand from a revision already in the index.
    pub fn persisted(dag: &DagIndex, id: &DocId, v: &Version, pe: &Perspective) -> Option<Self> {
        let rev = dag.get(id, v, pe)?;
        Some(Self {
            id: id.clone(),
            pe: pe.clone(),
            version: v.clone(),
            parents: rev.pa.clone(),
        })
    }
}

/// Which operand(s) have reached a given version during the BFS. A plain
/// two-bit set: full bitflags machinery would be overkill for two flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Source(u8);

impl Source {
    const X: Source = Source(0b01);
    const Y: Source = Source(0b10);

    fn empty() -> Self {
        Source(0)
    }

    fn all() -> Self {
        Source(0b11)
    }
}

impl std::ops::BitOr for Source {
    type Output = Source;
    fn bitor(self, rhs: Source) -> Source {
        Source(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Source {
    fn bitor_assign(&mut self, rhs: Source) {
        self.0 |= rhs.0;
    }
}

/// Finds the antichain of lowest common ancestors between `x` and `y`.
///
/// BFS expands both frontiers in lockstep, marking every visited version
/// with the set of operands (`X`, `Y`) that reached it; a version marked
/// from both sides is an LCA candidate. The final filter removes any
/// candidate that is itself an ancestor of another candidate, leaving the
/// antichain spec §4.4 calls for.
pub fn find_lca(dag: &DagIndex, x: &LcaOperand, y: &LcaOperand) -> Result<Vec<Version>, DagError> {
    if x.id != y.id {
        return Err(DagError::DifferentIds(x.id.clone(), y.id.clone()));
    }
    if x.version == y.version {
        return Ok(vec![x.version.clone()]);
    }

    let mut marks: HashMap<Version, Source> = HashMap::new();
    let mut first_seen_order: Vec<Version> = Vec::new();
    let mut queue_x: VecDeque<Version> = x.parents.iter().cloned().collect();
    let mut queue_y: VecDeque<Version> = y.parents.iter().cloned().collect();
    for v in &x.parents {
        marks.insert(v.clone(), Source::X);
    }
    for v in &y.parents {
        let entry = marks.entry(v.clone()).or_insert(Source::empty());
        *entry |= Source::Y;
    }

    let mut candidates: Vec<Version> = Vec::new();

    // Drain the Y frontier first so "first-encounter in the BFS from Y"
    // (spec's deterministic tie-break) is the natural iteration order.
    while !queue_x.is_empty() || !queue_y.is_empty() {
        if let Some(v) = queue_y.pop_front() {
            step(dag, &x.id, &x.pe, &y.pe, &v, Source::Y, &mut marks, &mut queue_y)?;
            if marks.get(&v) == Some(&Source::all()) && !first_seen_order.contains(&v) {
                first_seen_order.push(v.clone());
            }
        }
        if let Some(v) = queue_x.pop_front() {
            step(dag, &x.id, &x.pe, &y.pe, &v, Source::X, &mut marks, &mut queue_x)?;
            if marks.get(&v) == Some(&Source::all()) && !first_seen_order.contains(&v) {
                first_seen_order.push(v.clone());
            }
        }
    }

    for v in first_seen_order {
        candidates.push(v);
    }
    Ok(prune_non_minimal(dag, &x.id, &x.pe, &y.pe, candidates))
}

/// Expands the ancestry of `v`'s parents by one step from the `source`
/// side, marking them and enqueuing unmarked-from-that-side parents for
/// further expansion. Cross-perspective ancestor resolution (spec §4.4)
/// happens here: if `pe_x != pe_y`, `v` must exist in both to be a valid
/// ancestor to walk through.
#[allow(clippy::too_many_arguments)]
fn step(
    dag: &DagIndex,
    id: &DocId,
    pe_x: &Perspective,
    pe_y: &Perspective,
    v: &Version,
    source: Source,
    marks: &mut HashMap<Version, Source>,
    queue: &mut VecDeque<Version>,
) -> Result<(), DagError> {
    let rev = resolve(dag, id, v, pe_x, pe_y)?;
    for parent in &rev.pa {
        let was_marked = marks.contains_key(parent);
        let entry = marks.entry(parent.clone()).or_insert(Source::empty());
        let before = *entry;
        *entry |= source;
        if !was_marked || before != *entry {
            queue.push_back(parent.clone());
        }
    }
    Ok(())
}

/// Resolves `v` by preferring `pe_x`, falling back to `pe_y`. When the two
/// perspectives differ, `v` must be observable from whichever side (or
/// both) is querying it; if it exists in neither, the DAG is corrupt, and
/// if the specific perspective doing the asking can't see it at all while
/// the other can, that's `MissingPerspective` (spec §4.4).
fn resolve(
    dag: &DagIndex,
    id: &DocId,
    v: &Version,
    pe_x: &Perspective,
    pe_y: &Perspective,
) -> Result<crate::revision::Revision, DagError> {
    if pe_x == pe_y {
        return dag.get(id, v, pe_x).cloned().ok_or_else(|| {
            DagError::CorruptDag(format!("ancestor {} of {:?} not found in perspective {}", v, id, pe_x))
        });
    }
    match (dag.get(id, v, pe_x), dag.get(id, v, pe_y)) {
        (Some(r), Some(_)) => Ok(r.clone()),
        (Some(_), None) => Err(DagError::MissingPerspective {
            id: id.clone(),
            version: v.clone(),
            missing: pe_y.clone(),
            pe_x: pe_x.clone(),
            pe_y: pe_y.clone(),
        }),
        (None, Some(_)) => Err(DagError::MissingPerspective {
            id: id.clone(),
            version: v.clone(),
            missing: pe_x.clone(),
            pe_x: pe_x.clone(),
            pe_y: pe_y.clone(),
        }),
        (None, None) => Err(DagError::CorruptDag(format!(
            "ancestor {} of {:?} not found in either perspective",
            v, id
        ))),
    }
}

/// Removes candidates that are ancestors of another candidate, leaving an
/// antichain. Disconnected operands (no candidate ever marked by both
/// sides) naturally yield an empty vec here.
fn prune_non_minimal(
    dag: &DagIndex,
    id: &DocId,
    pe_x: &Perspective,
    pe_y: &Perspective,
    candidates: Vec<Version>,
) -> Vec<Version> {
    if candidates.len() <= 1 {
        return candidates;
    }
    let ancestor_sets: Vec<_> = candidates
        .iter()
        .map(|c| {
            let mut set = dag.ancestor_set(id, c, pe_x);
            set.extend(dag.ancestor_set(id, c, pe_y));
            set
        })
        .collect();
    candidates
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            !ancestor_sets
                .iter()
                .enumerate()
                .any(|(j, set)| j != *i && set.contains(*c))
        })
        .map(|(_, c)| c.clone())
        .collect()
}
