//! Per-collection worker (spec §4.10): wires an [`OplogReader`] into a
//! [`VersionedCollection`], draining local mutations in, running the
//! consistency pipeline, and handing merged revisions off for export.
//!
//! Runs as its own cooperative task rather than a separate OS process —
//! the isolation spec §4.10 describes (chroot, dropped privileges, core
//! dump limits) is applied once at the supervisor level in
//! [`crate::chroot`] before any worker starts, since this binary hosts all
//! VCs in one process rather than forking per collection.

use crate::settings::VcSettings;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use versync_core::{ConflictPolicy, OplogEntry, OplogReader, Perspective, Reconciled, Revision, Store, VersionedCollection};

/// A freshly merged revision ready to hand to the replicator for export, or
/// a completed batch boundary the caller can use to flush outbound queues.
pub enum WorkerEvent {
    Reconciled(Reconciled),
}

/// Drives one [`VersionedCollection`] to completion: tails its oplog,
/// saves each entry, and runs [`VersionedCollection::process_queues`] every
/// `settings.batch` entries or whenever the reader catches up to the live
/// tail, applying pause/resume backpressure against the inbound queue
/// depth per spec §5's "oplog-reader stream supports pause/resume".
pub async fn run<S: Store + 'static>(
    settings: VcSettings,
    vc: Arc<VersionedCollection<S>>,
    reader: Arc<OplogReader<S>>,
    events: mpsc::Sender<WorkerEvent>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let ns = format!("{}.{}", settings.db, settings.collection);
    let mut tail = reader.tail();
    let mut pending = 0usize;
    let mut paused = false;

    loop {
        let entry = tokio::select! {
            biased;
            _ = shutdown.notified() => {
                info!(%ns, "shutdown requested, draining current batch");
                break;
            }
            entry = tail.next() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        apply_entry(&vc, entry, &events).await;
        pending += 1;

        if pending >= settings.inbound_high_water && !paused {
            reader.pause();
            paused = true;
            warn!(%ns, pending, "pausing oplog reader, inbound backlog above high-water mark");
        }

        if pending >= settings.batch {
            flush(&vc, &events, &ns).await?;
            pending = 0;
        }

        if paused && pending <= settings.inbound_low_water {
            reader.resume();
            paused = false;
            debug!(%ns, "resuming oplog reader");
        }
    }

    flush(&vc, &events, &ns).await?;
    info!(%ns, "oplog tail ended");
    Ok(())
}

/// Saves `entry` into the local DAG segment, then writes it straight
/// through to the snapshot if it turned out to be the document's only head
/// — the common single-writer case, which otherwise wouldn't reach the
/// snapshot until a remote revision for the same id passed through
/// [`VersionedCollection::process_queues`].
async fn apply_entry<S: Store>(vc: &VersionedCollection<S>, entry: OplogEntry, events: &mpsc::Sender<WorkerEvent>) {
    let id = match entry.o2.clone().or_else(|| entry.o.get("_id").map(|_| entry.o.clone())) {
        Some(key) => key.get("_id").cloned().map(|v| match v {
            serde_json::Value::String(s) => versync_core::DocId::from(s.as_str()),
            other => versync_core::DocId::from(other.to_string()),
        }),
        None => None,
    };

    if let Err(e) = vc.save_oplog_entry(entry) {
        warn!(error = %e, "failed to save oplog entry into the local DAG segment");
        return;
    }

    let Some(id) = id else { return };
    match vc.write_through_if_solo(&id).await {
        Ok(Some(r)) => {
            let _ = events.send(WorkerEvent::Reconciled(r)).await;
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to write solo head through to the snapshot"),
    }
}

async fn flush<S: Store>(
    vc: &VersionedCollection<S>,
    events: &mpsc::Sender<WorkerEvent>,
    ns: &str,
) -> anyhow::Result<()> {
    let reconciled = vc.process_queues().await?;
    for r in reconciled {
        if events.send(WorkerEvent::Reconciled(r)).await.is_err() {
            debug!(%ns, "worker event channel closed, dropping remaining reconciled batch");
            break;
        }
    }
    Ok(())
}

/// Feeds one remote revision into a VC's inbound queue — the counterpart to
/// [`apply_entry`] for revisions arriving over a pull session rather than
/// the local oplog.
pub fn accept_remote<S: Store>(vc: &VersionedCollection<S>, rev: Revision, pe: &Perspective) {
    debug_assert!(!pe.is_local());
    vc.save_remote_revision(rev);
}

/// Conflict policy chosen for every VC this binary hosts: halting on a
/// merge conflict surfaces it to operators immediately rather than silently
/// dropping a document's reconciliation (spec §9 leaves the choice open;
/// see `DESIGN.md`).
pub const DEFAULT_CONFLICT_POLICY: ConflictPolicy = ConflictPolicy::HaltOnConflict;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MergePolicySetting, VcSettings};
    use versync_core::{MemoryStore, OplogOpKind, OplogReaderOptions, RevBody};

    fn doc(id: &str) -> RevBody {
        let mut m = RevBody::new();
        m.insert("_id".into(), serde_json::json!(id));
        m.insert("v".into(), serde_json::json!(1));
        m
    }

    #[tokio::test]
    async fn drains_oplog_into_a_reconciled_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let handle = store.open_capped("oplog.app.todos", 1 << 20).await.unwrap();
        store
            .append(
                &handle,
                OplogEntry {
                    ts: 1,
                    op: OplogOpKind::Insert,
                    ns: "app.todos".to_string(),
                    o: doc("a"),
                    o2: None,
                },
            )
            .await
            .unwrap();

        let vc = Arc::new(VersionedCollection::new(
            "m3.todos",
            store.clone(),
            Perspective::local(),
            DEFAULT_CONFLICT_POLICY,
        ));
        let reader = Arc::new(OplogReader::new(
            store.clone(),
            handle,
            "app.todos",
            OplogReaderOptions {
                tailable: false,
                tailable_retry_interval: std::time::Duration::from_millis(20),
                ..Default::default()
            },
        ));

        let settings = VcSettings {
            db: "app".into(),
            collection: "todos".into(),
            size_bytes: 1 << 20,
            batch: 1,
            merge_policy: MergePolicySetting::Conflict,
            inbound_high_water: 1024,
            inbound_low_water: 128,
        };
        let (tx, _rx) = mpsc::channel(8);
        run(settings, vc.clone(), reader, tx, Arc::new(Notify::new())).await.unwrap();

        let snapshot = vc.scan_snapshot(versync_core::ScanDirection::Asc).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].get("_id"), Some(&serde_json::json!("a")));
    }
}
