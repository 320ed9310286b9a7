//! The pre-auth server (spec §4.10/§6): accepts TCP or UNIX-socket
//! connections, reads exactly one JSON auth line, verifies credentials and
//! the export rule, then hands the now-authenticated connection off to the
//! owning VC worker as a [`PushRequest`].
//!
//! Runs as its own unprivileged, chrooted worker (see [`crate::chroot_stub`]
//! callers in the supervisor crate); this module only knows about sockets
//! and the handoff channel, not privilege dropping itself.

use crate::wire::{AuthLine, PushRequest, WireError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Validates a username/password pair against a named realm (the database).
/// An external collaborator per spec §1's "Non-goals" boundary; this crate
/// only calls it.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str, realm: &str) -> bool;
}

/// Resolves `(username, db, collection)` to the export rule governing it, or
/// `None` if nothing is exported to that peer. Implemented by
/// `versync-config::ReplicatorConfig` in the supervisor binary.
#[async_trait]
pub trait ExportLookup: Send + Sync {
    async fn hooks_for(&self, username: &str, db: &str, collection: &str) -> Option<Vec<String>>;
}

/// How long a connection has to send its auth line before being dropped
/// (spec §5: "implementation-defined window").
pub const AUTH_LINE_TIMEOUT: Duration = Duration::from_secs(10);

async fn handle_line<A, E>(
    mut line: String,
    verifier: &A,
    exports: &E,
) -> Result<(AuthLine, Vec<String>), WireError>
where
    A: AuthVerifier + ?Sized,
    E: ExportLookup + ?Sized,
{
    if line.ends_with('\n') {
        line.pop();
    }
    let auth = AuthLine::parse(&line)?;
    if !verifier.verify(&auth.username, &auth.password, &auth.db).await {
        return Err(WireError::InvalidAuthLine);
    }
    let hooks = exports
        .hooks_for(&auth.username, &auth.db, &auth.collection)
        .await
        .ok_or(WireError::NotExported)?;
    Ok((auth, hooks))
}

/// Runs one connection through the auth handshake; on success sends a
/// [`PushRequest`] to `handoff` and returns, leaving the connection's
/// remaining lifetime to the VC session that owns `handoff`'s receiver.
pub async fn serve_tcp_connection<A, E>(
    mut stream: TcpStream,
    verifier: &A,
    exports: &E,
    handoff: mpsc::Sender<PushRequest<TcpStream>>,
) where
    A: AuthVerifier + ?Sized,
    E: ExportLookup + ?Sized,
{
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut line = String::new();
    {
        let (reader, _writer) = stream.split();
        let mut reader = BufReader::new(reader);
        match tokio::time::timeout(AUTH_LINE_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => {
                warn!(%peer, "connection closed before sending an auth line");
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "failed reading auth line");
                return;
            }
        }
    }
    match handle_line(line, verifier, exports).await {
        Ok((auth, hooks)) => {
            info!(%peer, user = %auth.username, db = %auth.db, collection = %auth.collection, "authenticated");
            let req = PushRequest {
                peer: auth.username,
                hooks,
                offset: auth.offset,
                conn: stream,
            };
            let _ = handoff.send(req).await;
        }
        Err(WireError::NotExported) => {
            let _ = stream.write_all(b"requested collection not exported\n").await;
        }
        Err(_) => {
            let _ = stream.write_all(b"invalid auth request\n").await;
        }
    }
}

pub async fn serve_unix_connection<A, E>(
    mut stream: UnixStream,
    verifier: &A,
    exports: &E,
    handoff: mpsc::Sender<PushRequest<UnixStream>>,
) where
    A: AuthVerifier + ?Sized,
    E: ExportLookup + ?Sized,
{
    let mut line = String::new();
    {
        let (reader, _writer) = stream.split();
        let mut reader = BufReader::new(reader);
        match tokio::time::timeout(AUTH_LINE_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => return,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "failed reading auth line on unix socket");
                return;
            }
        }
    }
    match handle_line(line, verifier, exports).await {
        Ok((auth, hooks)) => {
            info!(user = %auth.username, db = %auth.db, collection = %auth.collection, "authenticated (unix)");
            let req = PushRequest {
                peer: auth.username,
                hooks,
                offset: auth.offset,
                conn: stream,
            };
            let _ = handoff.send(req).await;
        }
        Err(WireError::NotExported) => {
            let _ = stream.write_all(b"requested collection not exported\n").await;
        }
        Err(_) => {
            let _ = stream.write_all(b"invalid auth request\n").await;
        }
    }
}

/// Accepts connections on a bound TCP listener until the process is asked
/// to stop; each connection is spawned onto its own task so one slow client
/// can't stall the accept loop.
pub async fn run_tcp<A, E>(
    listener: TcpListener,
    verifier: std::sync::Arc<A>,
    exports: std::sync::Arc<E>,
    handoff: mpsc::Sender<PushRequest<TcpStream>>,
) where
    A: AuthVerifier + 'static,
    E: ExportLookup + 'static,
{
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let verifier = verifier.clone();
        let exports = exports.clone();
        let handoff = handoff.clone();
        tokio::spawn(async move {
            serve_tcp_connection(stream, verifier.as_ref(), exports.as_ref(), handoff).await;
        });
    }
}

pub async fn run_unix<A, E>(
    listener: UnixListener,
    verifier: std::sync::Arc<A>,
    exports: std::sync::Arc<E>,
    handoff: mpsc::Sender<PushRequest<UnixStream>>,
) where
    A: AuthVerifier + 'static,
    E: ExportLookup + 'static,
{
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let verifier = verifier.clone();
        let exports = exports.clone();
        let handoff = handoff.clone();
        tokio::spawn(async move {
            serve_unix_connection(stream, verifier.as_ref(), exports.as_ref(), handoff).await;
        });
    }
}
