//! The versioned system (spec §4.10, component C10): the process-wide
//! supervisor that owns every [`VersionedCollection`] worker, the pre-auth
//! server, and outbound pull requests.
//!
//! Everything here runs as async tasks inside one process rather than as
//! forked child processes — the isolation spec §4.10 calls for (chroot,
//! dropped privileges, raised core-dump limits) is applied once, for the
//! whole daemon, in [`chroot::chroot`], before [`VersionedSystem::listen`]
//! binds anything. See `DESIGN.md` for why a single-process async model was
//! chosen over per-worker process forking.

pub mod chroot;
pub mod settings;
pub mod worker;

use anyhow::Context;
use parking_lot::Mutex;
use settings::{Bind, VcSettings};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use versync_config::{Direction, ReplicatorConfig};
use versync_core::{OplogReader, OplogReaderOptions, Perspective, Revision, Store, VersionedCollection};
use versync_net::wire::{Endpoint, PullRequest};
use versync_net::{dial_tcp, dial_unix, AuthVerifier, DialRequest, ExportLookup};

/// Per-collection byte/doc/ack counters returned by [`VersionedSystem::info`].
#[derive(Clone, Debug, serde::Serialize)]
pub struct VcInfo {
    pub namespace: String,
    pub snapshot_docs: usize,
    pub revisions: usize,
    pub acknowledged: usize,
}

struct VcHandle<S> {
    vc: Arc<VersionedCollection<S>>,
}

/// Owns every versioned collection this node hosts plus the network surface
/// that replicates them. `S` is the store backing all of them; in practice
/// one store instance per process, shared across VCs via `Arc`.
pub struct VersionedSystem<S> {
    store: Arc<S>,
    config: ReplicatorConfig,
    vcs: Mutex<HashMap<String, VcHandle<S>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    stopped: std::sync::atomic::AtomicBool,
}

impl<S: Store + 'static> VersionedSystem<S> {
    pub fn new(store: Arc<S>, config: ReplicatorConfig) -> Self {
        Self {
            store,
            config,
            vcs: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(Notify::new()),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Spawns one worker per configured collection: opens its capped oplog
    /// mirror, builds a [`VersionedCollection`] over the snapshot namespace
    /// `m3.<collection>`, and wires a [`OplogReader`] into it. Returns the
    /// readers keyed by namespace so the caller can observe tailing
    /// activity without reaching into worker internals.
    pub async fn init_vcs(&self, vcs: Vec<VcSettings>) -> anyhow::Result<HashMap<String, Arc<OplogReader<S>>>> {
        let mut out = HashMap::new();
        for settings in vcs {
            let ns = format!("{}.{}", settings.db, settings.collection);
            let snapshot_ns = format!("m3.{}", settings.collection);
            let oplog_name = format!("oplog.{ns}");

            let handle = self
                .store
                .open_capped(&oplog_name, settings.size_bytes)
                .await
                .with_context(|| format!("opening capped oplog for {ns}"))?;

            let vc = Arc::new(
                VersionedCollection::new(snapshot_ns, self.store.clone(), Perspective::local(), worker::DEFAULT_CONFLICT_POLICY)
                    .with_merge_options(versync_core::MergeOptions {
                        tombstone_policy: settings.merge_policy.into(),
                        ..Default::default()
                    }),
            );

            let reader = Arc::new(OplogReader::new(
                self.store.clone(),
                handle,
                ns.clone(),
                OplogReaderOptions::default(),
            ));

            let (events_tx, mut events_rx) = mpsc::channel(settings.batch.max(1));
            tokio::spawn(async move {
                while let Some(worker::WorkerEvent::Reconciled(r)) = events_rx.recv().await {
                    tracing::trace!(id = %r.id, "reconciled");
                }
            });

            let task = tokio::spawn({
                let vc = vc.clone();
                let reader = reader.clone();
                let settings = settings.clone();
                let shutdown = self.shutdown.clone();
                async move {
                    if let Err(e) = worker::run(settings, vc, reader, events_tx, shutdown).await {
                        warn!(error = %e, "vc worker exited with an error");
                    }
                }
            });

            self.tasks.lock().push(task);
            self.vcs.lock().insert(ns.clone(), VcHandle { vc });
            out.insert(ns, reader);
            info!(collection = %settings.collection, "vc initialized");
        }
        Ok(out)
    }

    /// Forks the pre-auth listener: accepts connections on `bind`,
    /// authenticates each with `verifier`, resolves the export rule via
    /// `exports`, then streams the owning VC's revisions from the
    /// requested offset through the hook chain (spec §4.10, §6).
    ///
    /// Expects privileges to already have been dropped by [`chroot::chroot`]
    /// before this is called — this function only binds a socket and
    /// serves connections, it does not itself touch privileges.
    pub async fn listen<A, E>(self: &Arc<Self>, bind: Bind, verifier: Arc<A>, exports: Arc<E>) -> anyhow::Result<()>
    where
        A: AuthVerifier + 'static,
        E: ExportLookup + 'static,
    {
        match bind {
            Bind::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), port))
                    .await
                    .with_context(|| format!("binding pre-auth listener on {host}:{port}"))?;
                info!(%host, port, "pre-auth server listening");
                let (tx, mut rx) = mpsc::channel(64);
                let system = self.clone();
                tokio::spawn(async move {
                    while let Some(req) = rx.recv().await {
                        system.serve_export(req).await;
                    }
                });
                versync_net::run_tcp(listener, verifier, exports, tx).await;
            }
            Bind::Unix { path } => {
                let listener = UnixListener::bind(&path).with_context(|| format!("binding pre-auth unix socket at {}", path.display()))?;
                info!(path = %path.display(), "pre-auth server listening");
                let (tx, mut rx) = mpsc::channel(64);
                let system = self.clone();
                tokio::spawn(async move {
                    while let Some(req) = rx.recv().await {
                        system.serve_export_unix(req).await;
                    }
                });
                versync_net::run_unix(listener, verifier, exports, tx).await;
            }
        }
        Ok(())
    }

    async fn serve_export(&self, req: versync_net::wire::PushRequest<tokio::net::TcpStream>) {
        self.serve_export_generic(req).await;
    }

    async fn serve_export_unix(&self, req: versync_net::wire::PushRequest<tokio::net::UnixStream>) {
        self.serve_export_generic(req).await;
    }

    async fn serve_export_generic<Conn>(&self, req: versync_net::wire::PushRequest<Conn>)
    where
        Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let Some((db, collection)) = self.resolve_collection_for(&req.peer) else {
            warn!(peer = %req.peer, "handoff for a peer with no resolvable export rule");
            return;
        };
        let hooks = match self.config.load_hooks(&db, &collection, &req.peer, Direction::Export) {
            Ok(hooks) => hooks,
            Err(e) => {
                warn!(error = %e, "failed to load export hooks");
                return;
            }
        };
        let ns = format!("{db}.{collection}");
        let Some(vc) = self.vcs.lock().get(&ns).map(|h| h.vc.clone()) else {
            warn!(%ns, "no vc hosts the requested export namespace");
            return;
        };
        let source = futures::stream::iter(vc.outbound_since(req.offset));
        if let Err(e) = versync_net::run_export_session(req.conn, hooks, source).await {
            warn!(error = %e, "export session ended with an error");
        }
    }

    fn resolve_collection_for(&self, peer: &str) -> Option<(String, String)> {
        self.config
            .rules
            .iter()
            .find(|r| r.peer == peer && r.direction == Direction::Export)
            .map(|r| (r.db.clone(), r.collection.clone()))
    }

    /// Forwards a pull request to the VC that owns `(db, collection)`: dials
    /// the remote, authenticates, and streams inbound revisions into the
    /// VC's inbound queue until the stream ends or `deadline` expires (spec
    /// §4.10, §5 "Cancellation and timeouts").
    pub async fn send_pr(&self, req: PullRequest) -> anyhow::Result<()> {
        let ns = format!("{}.{}", req.database, req.collection);
        let vc = {
            let vcs = self.vcs.lock();
            vcs.get(&ns).map(|h| h.vc.clone())
        }
        .with_context(|| format!("no vc hosts {ns}"))?;

        let dial_req = DialRequest {
            username: req.username,
            password: req.password,
            endpoint: req.endpoint.clone(),
            database: req.database.clone(),
            collection: req.collection.clone(),
            offset: None,
            deadline: req.deadline_ms.map(std::time::Duration::from_millis),
        };

        type RevisionStream = std::pin::Pin<Box<dyn futures::Stream<Item = Result<Revision, versync_net::WireError>> + Send>>;
        let peer_pe = Perspective::new(format!("{}.{}", req.database, req.collection));
        let mut stream: RevisionStream = match &req.endpoint {
            Endpoint::Tcp { .. } => Box::pin(dial_tcp(dial_req).await?) as RevisionStream,
            Endpoint::Unix { .. } => Box::pin(dial_unix(dial_req).await?) as RevisionStream,
        };

        use futures::StreamExt;
        while let Some(item) = stream.next().await {
            match item {
                Ok(rev) => worker::accept_remote(&vc, rev, &peer_pe),
                Err(e) => {
                    warn!(error = %e, "pull session frame error");
                    break;
                }
            }
        }
        vc.process_queues().await?;
        Ok(())
    }

    /// Aggregate per-VC stats (spec §4.10's `info({extended})`).
    pub async fn info(&self) -> anyhow::Result<Vec<VcInfo>> {
        let handles: Vec<(String, Arc<VersionedCollection<S>>)> = self
            .vcs
            .lock()
            .iter()
            .map(|(ns, h)| (ns.clone(), h.vc.clone()))
            .collect();

        let mut out = Vec::with_capacity(handles.len());
        for (ns, vc) in handles {
            let snapshot = vc.scan_snapshot(versync_core::ScanDirection::Asc).await?;
            let (revisions, acknowledged) = vc.ack_stats();
            out.push(VcInfo {
                namespace: ns,
                snapshot_docs: snapshot.len(),
                revisions,
                acknowledged,
            });
        }
        Ok(out)
    }

    /// Graceful shutdown: signals every worker to stop after draining its
    /// current batch, then waits for them to exit.
    pub async fn stop(&self) {
        if self.stopped.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Forceful shutdown: aborts every worker task immediately rather than
    /// waiting for in-flight batches to drain (spec §5: "second shutdown
    /// signal aborts immediately").
    pub fn stop_term(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
