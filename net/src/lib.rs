//! Peer session plumbing (spec §6): the wire types shared by both ends of a
//! connection, the pre-auth server, the authenticated export session, and
//! the client-side dial used to satisfy pull requests.

pub mod dial;
pub mod preauth;
pub mod session;
pub mod wire;

pub use dial::{dial_tcp, dial_unix, read_rejection_line, DialRequest};
pub use preauth::{run_tcp, run_unix, serve_tcp_connection, serve_unix_connection, AuthVerifier, ExportLookup, AUTH_LINE_TIMEOUT};
pub use session::{run_export_session, ExportHandoff};
pub use wire::{AuthLine, Endpoint, PullRequest, PushRequest, RevisionCodec, WireError, MAX_AUTH_LINE_BYTES};
