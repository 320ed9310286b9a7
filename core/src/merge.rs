//! Three-way merge engine (spec §4.5, component C5).

use crate::dag::DagIndex;
use crate::error::MergeError;
use crate::lca::{find_lca, LcaOperand};
use crate::revision::{DocId, Perspective, RevBody, Revision, Version};
use std::collections::BTreeSet;

/// How to resolve a tombstone on one side against an edit on the other.
/// Per-key value conflicts (both sides changed the same field differently)
/// are never subject to this policy — those always fail with
/// [`MergeError::Conflict`]; this only covers whole-document delete-vs-edit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TombstonePolicy {
    DeleteWins,
    EditWins,
    Conflict,
}

/// A post-merge transform, applied in order to the merged body before it's
/// wrapped in a [`Revision`]. Deterministic: given the same merged body,
/// a hook must always return the same result.
pub type MergeHook = Box<dyn Fn(&RevBody) -> Option<RevBody> + Send + Sync>;

pub struct MergeOptions {
    pub tombstone_policy: TombstonePolicy,
    pub hooks: Vec<MergeHook>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            tombstone_policy: TombstonePolicy::Conflict,
            hooks: Vec::new(),
        }
    }
}

/// Recursion guard for [`virtual_base`]; a well-formed acyclic DAG never
/// comes close to this, it only fires against a pathological LCA set.
const MAX_VIRTUAL_BASE_DEPTH: usize = 64;

/// Three-way-merges `base`/`left`/`right` at the whole-document level. `None`
/// means "tombstoned" (no body).
fn merge_bodies(
    base: Option<&RevBody>,
    left: Option<&RevBody>,
    right: Option<&RevBody>,
    policy: TombstonePolicy,
) -> Result<Option<RevBody>, MergeError> {
    match (left, right) {
        (None, None) => Ok(None),
        (None, Some(r)) => {
            if Some(r) == base {
                // Right made no change since base; left's delete stands.
                Ok(None)
            } else {
                resolve_tombstone_conflict(policy, r.clone())
            }
        }
        (Some(l), None) => {
            if Some(l) == base {
                Ok(None)
            } else {
                resolve_tombstone_conflict(policy, l.clone())
            }
        }
        (Some(l), Some(r)) => merge_present_bodies(base, l, r).map(Some),
    }
}

fn resolve_tombstone_conflict(
    policy: TombstonePolicy,
    edited: RevBody,
) -> Result<Option<RevBody>, MergeError> {
    match policy {
        TombstonePolicy::DeleteWins => Ok(None),
        TombstonePolicy::EditWins => Ok(Some(edited)),
        TombstonePolicy::Conflict => Err(MergeError::Conflict(vec!["<document>".to_string()])),
    }
}

/// Per-key merge when both sides have a body. A key is a conflict only when
/// both sides changed it from the base to *different* values.
fn merge_present_bodies(base: Option<&RevBody>, left: &RevBody, right: &RevBody) -> Result<RevBody, MergeError> {
    let empty = RevBody::new();
    let base = base.unwrap_or(&empty);

    let mut keys: BTreeSet<&String> = BTreeSet::new();
    keys.extend(base.keys());
    keys.extend(left.keys());
    keys.extend(right.keys());

    let mut out = RevBody::new();
    let mut conflicts = Vec::new();
    for key in keys {
        let b = base.get(key);
        let l = left.get(key);
        let r = right.get(key);
        if l == r {
            if let Some(v) = l {
                out.insert(key.clone(), v.clone());
            }
            continue;
        }
        if l == b {
            if let Some(v) = r {
                out.insert(key.clone(), v.clone());
            }
            continue;
        }
        if r == b {
            if let Some(v) = l {
                out.insert(key.clone(), v.clone());
            }
            continue;
        }
        conflicts.push(key.clone());
    }

    if !conflicts.is_empty() {
        return Err(MergeError::Conflict(conflicts));
    }
    Ok(out)
}

/// Looks `v` up under `pe_a`, falling back to `pe_b` — mirrors
/// [`crate::lca`]'s cross-perspective resolution, since the same
/// content-addressed version may only be recorded under one of the two
/// perspectives a merge straddles.
fn get_either<'a>(
    dag: &'a DagIndex,
    id: &DocId,
    v: &Version,
    pe_a: &Perspective,
    pe_b: &Perspective,
) -> Option<&'a Revision> {
    dag.get(id, v, pe_a).or_else(|| dag.get(id, v, pe_b))
}

/// Recursively reduces a set of lowest common ancestors to a single virtual
/// base body (spec §4.5's "recursive virtual-base merging"), the same
/// strategy as a git recursive merge: fold the LCA set pairwise, using each
/// pair's own LCA as the base for reconciling *them*.
fn virtual_base(
    dag: &DagIndex,
    id: &DocId,
    pe_a: &Perspective,
    pe_b: &Perspective,
    versions: &[Version],
    opts: &MergeOptions,
    depth: usize,
) -> Result<Option<RevBody>, MergeError> {
    if depth > MAX_VIRTUAL_BASE_DEPTH {
        return Err(MergeError::MultiHeadLoop(id.clone()));
    }
    match versions {
        [] => Ok(None),
        [only] => Ok(get_either(dag, id, only, pe_a, pe_b).and_then(|r| r.body.clone())),
        [first, rest @ ..] => {
            let first_body = get_either(dag, id, first, pe_a, pe_b).and_then(|r| r.body.clone());
            let rest_body = virtual_base(dag, id, pe_a, pe_b, rest, opts, depth + 1)?;
            let nested_lca = if let Some(second) = rest.first() {
                let x = LcaOperand::persisted(dag, id, first, pe_a)
                    .or_else(|| LcaOperand::persisted(dag, id, first, pe_b))
                    .ok_or_else(|| MergeError::MultiHeadLoop(id.clone()))?;
                let y = LcaOperand::persisted(dag, id, second, pe_a)
                    .or_else(|| LcaOperand::persisted(dag, id, second, pe_b))
                    .ok_or_else(|| MergeError::MultiHeadLoop(id.clone()))?;
                find_lca(dag, &x, &y).map_err(|_| MergeError::MultiHeadLoop(id.clone()))?
            } else {
                Vec::new()
            };
            let nested_base = virtual_base(dag, id, pe_a, pe_b, &nested_lca, opts, depth + 1)?;
            merge_bodies(
                nested_base.as_ref(),
                first_body.as_ref(),
                rest_body.as_ref(),
                opts.tombstone_policy,
            )
        }
    }
}

/// Merges `left` and `right` (each possibly in its own perspective) into a
/// new revision parented on both, written into `out_pe`. This is the entry
/// point [`crate::vc::VersionedCollection`] calls once it has a pair of
/// concurrent heads to reconcile.
pub fn merge(
    dag: &DagIndex,
    id: &DocId,
    out_pe: &Perspective,
    left: (&Perspective, &Version),
    right: (&Perspective, &Version),
    opts: &MergeOptions,
) -> anyhow::Result<Revision> {
    let (pe_l, v_l) = left;
    let (pe_r, v_r) = right;

    let left_rev = dag
        .get(id, v_l, pe_l)
        .ok_or_else(|| anyhow::anyhow!("merge: left revision {} not found", v_l))?
        .clone();
    let right_rev = dag
        .get(id, v_r, pe_r)
        .ok_or_else(|| anyhow::anyhow!("merge: right revision {} not found", v_r))?
        .clone();

    let lca_versions = if v_l == v_r {
        vec![v_l.clone()]
    } else {
        let x = LcaOperand::persisted(dag, id, v_l, pe_l)
            .ok_or_else(|| anyhow::anyhow!("merge: left operand has no parents recorded"))?;
        let y = LcaOperand::persisted(dag, id, v_r, pe_r)
            .ok_or_else(|| anyhow::anyhow!("merge: right operand has no parents recorded"))?;
        find_lca(dag, &x, &y)?
    };

    let base = virtual_base(dag, id, pe_l, pe_r, &lca_versions, opts, 0)?;

    let mut merged = merge_bodies(
        base.as_ref(),
        left_rev.body.as_ref(),
        right_rev.body.as_ref(),
        opts.tombstone_policy,
    )?;

    for hook in &opts.hooks {
        if let Some(body) = merged.as_ref() {
            if let Some(replacement) = hook(body) {
                merged = Some(replacement);
            }
        }
    }

    let mut parents = vec![v_l.clone(), v_r.clone()];
    parents.sort();
    parents.dedup();
    Ok(Revision::child(id.clone(), out_pe.clone(), parents, merged, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::RevBody;

    fn doc(pairs: &[(&str, serde_json::Value)]) -> RevBody {
        let mut m = RevBody::new();
        for (k, v) in pairs {
            m.insert((*k).to_string(), v.clone());
        }
        m
    }

    fn insert_chain(dag: &mut DagIndex, id: &DocId, pe: &Perspective, bodies: &[RevBody]) -> Vec<Version> {
        let mut versions = Vec::new();
        let mut parents = Vec::new();
        for body in bodies {
            let rev = Revision::child(id.clone(), pe.clone(), parents.clone(), Some(body.clone()), true);
            versions.push(rev.v.clone());
            parents = vec![rev.v.clone()];
            dag.insert(rev).unwrap();
        }
        versions
    }

    #[test]
    fn non_conflicting_edits_merge_cleanly() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let base = doc(&[("a", serde_json::json!(1)), ("b", serde_json::json!(1))]);
        let versions = insert_chain(&mut dag, &id, &pe, &[base]);
        let base_v = versions[0].clone();

        let left = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(2)), ("b", serde_json::json!(1))])),
            true,
        );
        let right = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(1)), ("b", serde_json::json!(2))])),
            true,
        );
        dag.insert(left.clone()).unwrap();
        dag.insert(right.clone()).unwrap();

        let merged = merge(&dag, &id, &pe, (&pe, &left.v), (&pe, &right.v), &MergeOptions::default()).unwrap();
        let body = merged.body.unwrap();
        assert_eq!(body.get("a"), Some(&serde_json::json!(2)));
        assert_eq!(body.get("b"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn same_key_conflict_is_rejected() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let base = doc(&[("a", serde_json::json!(1))]);
        let versions = insert_chain(&mut dag, &id, &pe, &[base]);
        let base_v = versions[0].clone();

        let left = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(2))])),
            true,
        );
        let right = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(3))])),
            true,
        );
        dag.insert(left.clone()).unwrap();
        dag.insert(right.clone()).unwrap();

        let err = merge(&dag, &id, &pe, (&pe, &left.v), (&pe, &right.v), &MergeOptions::default()).unwrap_err();
        assert!(err.downcast_ref::<MergeError>().is_some());
    }

    #[test]
    fn delete_wins_policy_drops_edit() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let base = doc(&[("a", serde_json::json!(1))]);
        let versions = insert_chain(&mut dag, &id, &pe, &[base]);
        let base_v = versions[0].clone();

        let deleted = Revision::child(id.clone(), pe.clone(), vec![base_v.clone()], None, true);
        let edited = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(2))])),
            true,
        );
        dag.insert(deleted.clone()).unwrap();
        dag.insert(edited.clone()).unwrap();

        let opts = MergeOptions {
            tombstone_policy: TombstonePolicy::DeleteWins,
            hooks: Vec::new(),
        };
        let merged = merge(&dag, &id, &pe, (&pe, &deleted.v), (&pe, &edited.v), &opts).unwrap();
        assert!(merged.body.is_none());
        assert!(merged.d);
    }

    #[test]
    fn edit_wins_policy_keeps_edit() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let base = doc(&[("a", serde_json::json!(1))]);
        let versions = insert_chain(&mut dag, &id, &pe, &[base]);
        let base_v = versions[0].clone();

        let deleted = Revision::child(id.clone(), pe.clone(), vec![base_v.clone()], None, true);
        let edited = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(2))])),
            true,
        );
        dag.insert(deleted.clone()).unwrap();
        dag.insert(edited.clone()).unwrap();

        let opts = MergeOptions {
            tombstone_policy: TombstonePolicy::EditWins,
            hooks: Vec::new(),
        };
        let merged = merge(&dag, &id, &pe, (&pe, &deleted.v), (&pe, &edited.v), &opts).unwrap();
        assert_eq!(merged.body.unwrap().get("a"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn merge_hook_can_rewrite_result() {
        let mut dag = DagIndex::new();
        let id = DocId::from("X");
        let pe = Perspective::local();
        let base = doc(&[("a", serde_json::json!(1))]);
        let versions = insert_chain(&mut dag, &id, &pe, &[base]);
        let base_v = versions[0].clone();

        let left = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(1)), ("tag", serde_json::json!("left"))])),
            true,
        );
        let right = Revision::child(
            id.clone(),
            pe.clone(),
            vec![base_v.clone()],
            Some(doc(&[("a", serde_json::json!(1)), ("note", serde_json::json!("right"))])),
            true,
        );
        dag.insert(left.clone()).unwrap();
        dag.insert(right.clone()).unwrap();

        let opts = MergeOptions {
            tombstone_policy: TombstonePolicy::Conflict,
            hooks: vec![Box::new(|body: &RevBody| {
                let mut next = body.clone();
                next.insert("merged_by_hook".to_string(), serde_json::json!(true));
                Some(next)
            })],
        };
        let merged = merge(&dag, &id, &pe, (&pe, &left.v), (&pe, &right.v), &opts).unwrap();
        assert_eq!(merged.body.unwrap().get("merged_by_hook"), Some(&serde_json::json!(true)));
    }
}
