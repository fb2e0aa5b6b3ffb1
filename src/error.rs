//! Error types surfaced by the engine and its components.

use std::io;

use thiserror::Error;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type for all engine operations.
///
/// Protocol violations are non-fatal to a session: the offending message is
/// dropped and the connection keeps going. Transfer failures carry the reason
/// string that is recorded on the transfer and reported to the remote side
/// where the protocol calls for it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A frame or payload that violates the wire format (oversized frame,
    /// list count over cap, string over cap, truncated payload).
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The server refused the login, with its reason string.
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// The peer could not be reached directly and the pierce wait expired.
    #[error("Peer unreachable (firewall)")]
    PeerUnreachable,

    /// The remote side declined the transfer, with its reason.
    #[error("peer rejected transfer: {0}")]
    PeerRejected(String),

    /// A pending operation outlived its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The server TCP link died. Pending work that needs the server fails
    /// with this; transfers already streaming are unaffected.
    #[error("server connection lost")]
    ServerDisconnected,

    /// A component task has shut down and its channel is closed.
    #[error("engine channel closed")]
    ChannelClosed,

    /// An OS level failure on a socket or file.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The reason string recorded on a transfer that fails with this error.
    pub fn transfer_reason(&self) -> String {
        match self {
            Error::PeerRejected(reason) => reason.clone(),
            other => other.to_string(),
        }
    }

    /// A copy suitable for fanning one failure out to several waiters.
    /// I/O errors collapse to `PeerUnreachable`, the rest keep their kind.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::Protocol(what) => Error::Protocol(what),
            Error::LoginRejected(reason) => Error::LoginRejected(reason.clone()),
            Error::PeerUnreachable => Error::PeerUnreachable,
            Error::PeerRejected(reason) => Error::PeerRejected(reason.clone()),
            Error::Timeout(what) => Error::Timeout(what),
            Error::ServerDisconnected => Error::ServerDisconnected,
            Error::ChannelClosed => Error::ChannelClosed,
            Error::Io(_) => Error::PeerUnreachable,
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ChannelClosed
    }
}
