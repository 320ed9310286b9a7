//! Wire types for peer sessions (spec §6): the JSON auth line exchanged at
//! connection setup, the internal pull/push request shapes the supervisor
//! and VC workers pass between themselves, and the length-prefixed binary
//! framing used once a session is streaming revisions.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use versync_core::Revision;

/// Max length of the JSON auth line, including the trailing `\n` (spec §6.2).
pub const MAX_AUTH_LINE_BYTES: usize = 254;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("auth line exceeds {MAX_AUTH_LINE_BYTES} bytes")]
    AuthLineTooLong,
    #[error("invalid auth request")]
    InvalidAuthLine,
    #[error("requested collection not exported")]
    NotExported,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

/// The JSON line a client sends immediately after connecting (spec §6.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthLine {
    pub username: String,
    pub password: String,
    pub db: String,
    pub collection: String,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl AuthLine {
    pub fn parse(line: &str) -> Result<Self, WireError> {
        if line.len() + 1 > MAX_AUTH_LINE_BYTES {
            return Err(WireError::AuthLineTooLong);
        }
        serde_json::from_str(line).map_err(|_| WireError::InvalidAuthLine)
    }

    pub fn to_line(&self) -> Result<String, WireError> {
        let mut s = serde_json::to_string(self).map_err(|_| WireError::InvalidAuthLine)?;
        s.push('\n');
        if s.len() > MAX_AUTH_LINE_BYTES {
            return Err(WireError::AuthLineTooLong);
        }
        Ok(s)
    }
}

/// Either a host:port pair or a UNIX socket path, never both (spec §6.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

/// Supervisor → VC: dial a remote peer and pull missing revisions (spec §6.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub username: String,
    pub password: String,
    pub endpoint: Endpoint,
    pub database: String,
    pub collection: String,
    /// Optional deadline in milliseconds; aborts the dial/stream on expiry.
    pub deadline_ms: Option<u64>,
}

/// Pre-auth → VC: a freshly authenticated connection plus the export rule
/// that governs what it may see (spec §6.3).
pub struct PushRequest<Conn> {
    pub peer: String,
    pub hooks: Vec<String>,
    pub offset: Option<u64>,
    pub conn: Conn,
}

/// Length-prefixed bincode framing for [`Revision`] values streamed after a
/// session is authenticated: a `u32` big-endian length header followed by
/// the encoded revision.
#[derive(Default)]
pub struct RevisionCodec;

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

impl Encoder<Revision> for RevisionCodec {
    type Error = WireError;

    fn encode(&mut self, item: Revision, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&item)?;
        dst.extend_from_slice(&(body.len() as u32).to_be_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for RevisionCodec {
    type Item = Revision;
    type Error = WireError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized revision frame",
            )));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        let frame = src.split_to(4 + len);
        let rev = bincode::deserialize(&frame[4..])?;
        Ok(Some(rev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use versync_core::{DocId, Perspective, Revision};

    #[test]
    fn auth_line_round_trips() {
        let line = AuthLine {
            username: "alice".into(),
            password: "hunter2".into(),
            db: "app".into(),
            collection: "todos".into(),
            offset: Some(42),
        };
        let encoded = line.to_line().unwrap();
        let decoded = AuthLine::parse(encoded.trim_end()).unwrap();
        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.offset, Some(42));
    }

    #[test]
    fn overlong_auth_line_is_rejected() {
        let line = AuthLine {
            username: "a".repeat(300),
            password: String::new(),
            db: "app".into(),
            collection: "todos".into(),
            offset: None,
        };
        assert!(matches!(line.to_line(), Err(WireError::AuthLineTooLong)));
    }

    #[test]
    fn revision_codec_round_trips_through_a_buffer() {
        let rev = Revision::root(DocId::from("doc-1"), Perspective::local(), None, true);
        let mut codec = RevisionCodec;
        let mut buf = bytes::BytesMut::new();
        codec.encode(rev.clone(), &mut buf).unwrap();
        // Partial delivery: decode sees only the length header first.
        let mut head = buf.split_to(4);
        assert!(codec.decode(&mut head).unwrap().is_none());
        head.unsplit(buf);
        let decoded = codec.decode(&mut head).unwrap().unwrap();
        assert_eq!(decoded.id, rev.id);
    }
}
