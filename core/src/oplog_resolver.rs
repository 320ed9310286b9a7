//! The oplog resolver (spec §4.8, component C8): on startup, finds which
//! oplog entry produced the snapshot collection's current head, so the
//! oplog reader (§4.7) can resume tailing from the right offset instead of
//! replaying (or skipping) history.
//!
//! Walks the oplog newest-to-oldest for the document's key. Each entry type
//! advances the FSM into a candidate state (`Einsert`, `Eupdate`, `Eupdate2`,
//! `Edelete`); the entry is accepted ("ack") once its effect is shown to
//! reproduce the snapshot's current body, otherwise the walk continues
//! further back. Modifier updates (`$set`/`$unset`) can't be compared
//! directly to the target body, so they're tie-broken by reapplying the
//! modifier to the DAG head's parent body and comparing *that*. Reaching a
//! collection-create entry (`cd`) without a match means the snapshot is
//! fresh: the walk stops there and the create entry itself is the result.

use crate::revision::{OplogEntry, OplogOpKind, RevBody};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Scanning, no candidate yet.
    S,
    /// Considering an insert (`ci`) as the origin of the current state.
    Einsert,
    /// Considering a full-document update (`cu`).
    Eupdate,
    /// Considering a modifier update (`cuf`), tie-broken against the parent.
    Eupdate2,
    /// Considering a delete (`si`/`cd`) as having produced a tombstone.
    Edelete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The oplog offset whose effect reproduces the current snapshot head.
    Resolved(u64),
    /// The oplog window doesn't reach far enough back to explain the
    /// current head: the stream ran out before a match or a
    /// collection-create entry was found.
    NotFound,
}

fn doc_id_of(entry: &OplogEntry) -> Option<&serde_json::Value> {
    entry.o2.as_ref().and_then(|o2| o2.get("_id")).or_else(|| entry.o.get("_id"))
}

fn matches_key(entry: &OplogEntry, key: &RevBody) -> bool {
    match (doc_id_of(entry), key.get("_id")) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Applies a `$set`/`$unset` modifier document to `base`.
pub fn apply_modifier(base: &RevBody, modifier: &RevBody) -> RevBody {
    let mut out = base.clone();
    if let Some(serde_json::Value::Object(set)) = modifier.get("$set") {
        for (k, v) in set {
            out.insert(k.clone(), v.clone());
        }
    }
    if let Some(serde_json::Value::Object(unset)) = modifier.get("$unset") {
        for k in unset.keys() {
            out.remove(k);
        }
    }
    out
}

/// Runs the FSM over an already-materialized, newest-first slice of oplog
/// entries. Exposed separately from [`resolve`] so callers that already
/// hold the oplog in memory (e.g. tests, or a resolver replaying a bounded
/// window) don't need to wrap it in a stream.
pub fn resolve_slice(
    entries_newest_first: &[OplogEntry],
    ns: &str,
    key: &RevBody,
    target: Option<&RevBody>,
    parent: Option<&RevBody>,
) -> ResolveOutcome {
    let mut state = State::S;
    for entry in entries_newest_first {
        if entry.ns != ns {
            continue;
        }
        if entry.op == OplogOpKind::Create {
            return ResolveOutcome::Resolved(entry.ts);
        }
        if !matches_key(entry, key) {
            continue;
        }
        match entry.op {
            OplogOpKind::Create => unreachable!("handled above"),
            OplogOpKind::Delete => {
                state = State::Edelete;
                if target.is_none() {
                    return ResolveOutcome::Resolved(entry.ts);
                }
            }
            OplogOpKind::Insert => {
                state = State::Einsert;
                if target == Some(&entry.o) {
                    return ResolveOutcome::Resolved(entry.ts);
                }
            }
            OplogOpKind::Update => {
                if entry.is_modifier_update() {
                    state = State::Eupdate2;
                    if let Some(p) = parent {
                        let applied = apply_modifier(p, &entry.o);
                        if target == Some(&applied) {
                            return ResolveOutcome::Resolved(entry.ts);
                        }
                    }
                } else {
                    state = State::Eupdate;
                    if target == Some(&entry.o) {
                        return ResolveOutcome::Resolved(entry.ts);
                    }
                }
            }
        }
    }
    let _ = state;
    ResolveOutcome::NotFound
}

/// Streaming form of [`resolve_slice`]: pulls from an already-reversed
/// (newest-first) oplog stream one entry at a time and stops at the first
/// match, so a resolver run against a large oplog doesn't have to
/// materialize it up front. The result is produced exactly once.
pub async fn resolve(
    mut entries_newest_first: Pin<Box<dyn Stream<Item = OplogEntry> + Send>>,
    ns: &str,
    key: &RevBody,
    target: Option<&RevBody>,
    parent: Option<&RevBody>,
) -> ResolveOutcome {
    while let Some(entry) = entries_newest_first.next().await {
        match resolve_slice(std::slice::from_ref(&entry), ns, key, target, parent) {
            ResolveOutcome::Resolved(ts) => return ResolveOutcome::Resolved(ts),
            ResolveOutcome::NotFound => continue,
        }
    }
    ResolveOutcome::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> RevBody {
        let mut m = RevBody::new();
        m.insert("_id".into(), serde_json::json!(id));
        m
    }

    fn insert(ts: u64, ns: &str, body: RevBody) -> OplogEntry {
        OplogEntry {
            ts,
            op: OplogOpKind::Insert,
            ns: ns.to_string(),
            o: body,
            o2: None,
        }
    }

    fn full_update(ts: u64, ns: &str, id: &str, body: RevBody) -> OplogEntry {
        let mut o = body;
        o.insert("_id".into(), serde_json::json!(id));
        OplogEntry {
            ts,
            op: OplogOpKind::Update,
            ns: ns.to_string(),
            o,
            o2: Some(key(id)),
        }
    }

    fn modifier_update(ts: u64, ns: &str, id: &str, set: RevBody) -> OplogEntry {
        let mut o = RevBody::new();
        o.insert("$set".into(), serde_json::Value::Object(set));
        OplogEntry {
            ts,
            op: OplogOpKind::Update,
            ns: ns.to_string(),
            o,
            o2: Some(key(id)),
        }
    }

    fn delete(ts: u64, ns: &str, id: &str) -> OplogEntry {
        OplogEntry {
            ts,
            op: OplogOpKind::Delete,
            ns: ns.to_string(),
            o: key(id),
            o2: Some(key(id)),
        }
    }

    #[test]
    fn resolves_matching_insert() {
        let mut body = key("a");
        body.insert("v".into(), serde_json::json!(1));
        let entries = vec![insert(1, "db.c", body.clone())];
        let out = resolve_slice(&entries, "db.c", &key("a"), Some(&body), None);
        assert_eq!(out, ResolveOutcome::Resolved(1));
    }

    #[test]
    fn resolves_matching_full_update_over_older_insert() {
        let mut old = key("a");
        old.insert("v".into(), serde_json::json!(1));
        let mut new = key("a");
        new.insert("v".into(), serde_json::json!(2));

        let entries = vec![
            full_update(2, "db.c", "a", new.clone()),
            insert(1, "db.c", old),
        ];
        let out = resolve_slice(&entries, "db.c", &key("a"), Some(&new), None);
        assert_eq!(out, ResolveOutcome::Resolved(2));
    }

    #[test]
    fn modifier_update_tie_broken_by_reapplying_to_parent() {
        let mut parent = key("a");
        parent.insert("v".into(), serde_json::json!(1));
        let mut set = RevBody::new();
        set.insert("v".into(), serde_json::json!(2));
        let mut target = key("a");
        target.insert("v".into(), serde_json::json!(2));

        let entries = vec![modifier_update(2, "db.c", "a", set)];
        let out = resolve_slice(&entries, "db.c", &key("a"), Some(&target), Some(&parent));
        assert_eq!(out, ResolveOutcome::Resolved(2));
    }

    #[test]
    fn delete_resolves_a_tombstoned_target() {
        let entries = vec![delete(3, "db.c", "a")];
        let out = resolve_slice(&entries, "db.c", &key("a"), None, None);
        assert_eq!(out, ResolveOutcome::Resolved(3));
    }

    #[test]
    fn collection_create_resolves_to_itself() {
        let entries = vec![OplogEntry {
            ts: 0,
            op: OplogOpKind::Create,
            ns: "db.c".to_string(),
            o: RevBody::new(),
            o2: None,
        }];
        let out = resolve_slice(&entries, "db.c", &key("a"), Some(&key("a")), None);
        assert_eq!(out, ResolveOutcome::Resolved(0));
    }

    #[test]
    fn create_behind_several_inserts_is_still_reached() {
        // oplog (oldest to newest): create m3.foo, then inserts into foo.
        // Walking newest-first, the inserts don't match `a` so the walk
        // reaches the create and resolves to it.
        let entries = vec![
            insert(3, "db.c", key("other")),
            insert(2, "db.c", key("another")),
            OplogEntry {
                ts: 1,
                op: OplogOpKind::Create,
                ns: "db.c".to_string(),
                o: RevBody::new(),
                o2: None,
            },
        ];
        let out = resolve_slice(&entries, "db.c", &key("a"), Some(&key("a")), None);
        assert_eq!(out, ResolveOutcome::Resolved(1));
    }

    #[test]
    fn unrelated_key_is_skipped() {
        let entries = vec![insert(1, "db.c", key("other"))];
        let out = resolve_slice(&entries, "db.c", &key("a"), Some(&key("a")), None);
        assert_eq!(out, ResolveOutcome::NotFound);
    }

    #[tokio::test]
    async fn streaming_resolve_matches_slice_form() {
        let mut body = key("a");
        body.insert("v".into(), serde_json::json!(1));
        let s = futures::stream::iter(vec![insert(1, "db.c", body.clone())]);
        let out = resolve(Box::pin(s), "db.c", &key("a"), Some(&body), None).await;
        assert_eq!(out, ResolveOutcome::Resolved(1));
    }
}
