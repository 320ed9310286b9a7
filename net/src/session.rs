//! The server side of an authenticated peer session (spec §6.2 step 5):
//! streams length-prefixed revisions from an offset, applying the export
//! hook chain to each one before it goes out over the wire.

use crate::wire::{PushRequest, RevisionCodec, WireError};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::codec::Framed;
use tracing::{trace, warn};
use versync_core::{MergeHook, Revision};

/// Applies `hooks` in order to `rev`'s body; `None` from any hook drops the
/// revision from the outbound stream entirely (the hook chain doubles as an
/// export filter, not just a transform).
fn apply_hooks(mut rev: Revision, hooks: &[MergeHook]) -> Option<Revision> {
    for hook in hooks {
        match rev.body.as_ref() {
            Some(body) => match hook(body) {
                Some(new_body) => rev.body = Some(new_body),
                None => return None,
            },
            None => continue,
        }
    }
    Some(rev)
}

/// Streams every revision from `source` (already filtered to `offset` by the
/// caller) over `conn`, applying `hooks`. Runs until `source` ends or the
/// connection errors; the wire protocol never closes this stream on its own
/// (spec §6.2: "open-ended").
pub async fn run_export_session<Conn, S>(
    conn: Conn,
    hooks: Vec<MergeHook>,
    mut source: S,
) -> Result<(), WireError>
where
    Conn: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    S: Stream<Item = Revision> + Unpin,
{
    let mut framed = Framed::new(conn, RevisionCodec);
    while let Some(rev) = source.next().await {
        let id = rev.id.clone();
        match apply_hooks(rev, &hooks) {
            Some(rev) => {
                trace!(%id, "exporting revision");
                if let Err(e) = framed.send(rev).await {
                    warn!(%id, error = %e, "export session write failed");
                    return Err(e);
                }
            }
            None => trace!(%id, "revision dropped by export hook"),
        }
    }
    Ok(())
}

/// Builds the session's write side directly, for callers that already have
/// a framed sink (e.g. the dial-side reader driving its own write half).
pub async fn forward_one<Si>(sink: &mut Si, rev: Revision, hooks: &[MergeHook]) -> Result<(), WireError>
where
    Si: Sink<Revision, Error = WireError> + Unpin,
{
    if let Some(rev) = apply_hooks(rev, hooks) {
        sink.send(rev).await?;
    }
    Ok(())
}

/// Describes the handoff a pre-auth worker forwards to the owning VC: the
/// connection is authenticated, the export rule resolved to a hook chain,
/// and streaming can begin immediately from `offset`.
pub struct ExportHandoff<Conn> {
    pub conn: Conn,
    pub peer: String,
    pub hooks: Vec<MergeHook>,
    pub offset: Option<u64>,
}

impl<Conn> From<(PushRequest<Conn>, Vec<MergeHook>)> for ExportHandoff<Conn> {
    fn from((req, hooks): (PushRequest<Conn>, Vec<MergeHook>)) -> Self {
        Self {
            conn: req.conn,
            peer: req.peer,
            hooks,
            offset: req.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use versync_core::{DocId, Perspective};

    fn rev_with(id: &str, key: &str, val: &str) -> Revision {
        let mut body = versync_core::RevBody::new();
        body.insert(key.to_string(), serde_json::json!(val));
        Revision::root(DocId::from(id), Perspective::local(), Some(body), true)
    }

    #[test]
    fn hook_chain_can_drop_a_revision() {
        let rev = rev_with("a", "v", "1");
        let drop_all: MergeHook = Box::new(|_| None);
        assert!(apply_hooks(rev, &[drop_all]).is_none());
    }

    #[test]
    fn hook_chain_transforms_in_order() {
        let rev = rev_with("a", "password", "secret");
        let redact: MergeHook = Box::new(|body| {
            let mut out = body.clone();
            out.insert("password".into(), serde_json::json!("[redacted]"));
            Some(out)
        });
        let out = apply_hooks(rev, &[redact]).unwrap();
        assert_eq!(out.body.unwrap().get("password").unwrap(), "[redacted]");
    }

    #[tokio::test]
    async fn export_session_streams_through_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let revs = vec![rev_with("a", "v", "1"), rev_with("b", "v", "2")];
        let source = stream::iter(revs.clone());
        let handle = tokio::spawn(run_export_session(server, Vec::new(), source));

        let mut framed = Framed::new(client, RevisionCodec);
        let first = framed.next().await.unwrap().unwrap();
        let second = framed.next().await.unwrap().unwrap();
        assert_eq!(first.id, revs[0].id);
        assert_eq!(second.id, revs[1].id);
        drop(framed);
        handle.await.unwrap().unwrap();
    }
}
