//! Client-side dial: sends a pull request's credentials over a fresh
//! connection and returns a stream of the revisions the remote exports from
//! the requested offset (spec §6.3).

use crate::wire::{AuthLine, Endpoint, RevisionCodec, WireError};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::FramedRead;
use versync_core::Revision;

/// A pull request's resolved identity, distinct from [`crate::wire::PullRequest`]
/// so dialing code doesn't need to know about the supervisor's internal
/// channel plumbing.
pub struct DialRequest {
    pub username: String,
    pub password: String,
    pub endpoint: Endpoint,
    pub database: String,
    pub collection: String,
    pub offset: Option<u64>,
    pub deadline: Option<Duration>,
}

async fn send_auth_line<W: AsyncWriteExt + Unpin>(writer: &mut W, req: &DialRequest) -> Result<(), WireError> {
    let line = AuthLine {
        username: req.username.clone(),
        password: req.password.clone(),
        db: req.database.clone(),
        collection: req.collection.clone(),
        offset: req.offset,
    }
    .to_line()?;
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Dials a TCP export endpoint, authenticates, and returns the revision
/// stream. Applies `req.deadline` to the connect-and-authenticate phase
/// only; once streaming starts the connection runs open-ended, matching the
/// server's behavior.
pub async fn dial_tcp(req: DialRequest) -> Result<impl Stream<Item = Result<Revision, WireError>>, WireError> {
    let Endpoint::Tcp { host, port } = &req.endpoint else {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "dial_tcp called with a non-tcp endpoint",
        )));
    };
    let addr = format!("{host}:{port}");
    let connect = async {
        let mut stream = TcpStream::connect(&addr).await?;
        send_auth_line(&mut stream, &req).await?;
        Ok::<_, WireError>(stream)
    };
    let stream = match req.deadline {
        Some(d) => tokio::time::timeout(d, connect)
            .await
            .map_err(|_| WireError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial deadline exceeded")))??,
        None => connect.await?,
    };
    Ok(FramedRead::new(stream, RevisionCodec))
}

/// UNIX-socket counterpart to [`dial_tcp`].
pub async fn dial_unix(req: DialRequest) -> Result<impl Stream<Item = Result<Revision, WireError>>, WireError> {
    let Endpoint::Unix { path } = &req.endpoint else {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "dial_unix called with a non-unix endpoint",
        )));
    };
    let connect = async {
        let mut stream = UnixStream::connect(path).await?;
        send_auth_line(&mut stream, &req).await?;
        Ok::<_, WireError>(stream)
    };
    let stream = match req.deadline {
        Some(d) => tokio::time::timeout(d, connect)
            .await
            .map_err(|_| WireError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial deadline exceeded")))??,
        None => connect.await?,
    };
    Ok(FramedRead::new(stream, RevisionCodec))
}

/// Reads the server's rejection line (`"invalid auth request\n"` or
/// `"requested collection not exported\n"`) when a dial is refused before
/// any binary framing begins. Callers that want a friendlier error than a
/// truncated-frame decode failure should call this instead of
/// [`dial_tcp`]/[`dial_unix`] when they expect rejection is likely.
pub async fn read_rejection_line<R: tokio::io::AsyncRead + Unpin>(reader: R) -> Option<String> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(n) if n > 0 => Some(line.trim_end().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auth_line_is_written_to_the_connection() {
        let (mut server, client) = tokio::io::duplex(4096);
        let req = DialRequest {
            username: "alice".into(),
            password: "hunter2".into(),
            endpoint: Endpoint::Tcp { host: "x".into(), port: 1 },
            database: "app".into(),
            collection: "todos".into(),
            offset: Some(7),
            deadline: None,
        };
        let mut client = client;
        tokio::spawn(async move {
            send_auth_line(&mut client, &req).await.unwrap();
        });
        let mut buf = String::new();
        let mut reader = BufReader::new(&mut server);
        reader.read_line(&mut buf).await.unwrap();
        let parsed = AuthLine::parse(buf.trim_end()).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.offset, Some(7));
    }
}
