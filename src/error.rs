//! Error taxonomy for the daemon client connection subsystem.
//!
//! `MessageIoError` and `ProtocolError` are internal to the transport layer
//! and never escape a [`crate::connection::Connection`]; callers only ever
//! see [`ConnectError`], [`StaleAddress`], or [`Interrupted`].

use std::io;

use crate::daemon::DaemonId;
use crate::diagnostics::Diagnostics;

/// Low-level transport failure. Always upgraded to [`ConnectError`] or
/// [`StaleAddress`] before leaving a `Connection`.
#[derive(Debug, thiserror::Error)]
pub enum MessageIoError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A malformed frame on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame truncated before a complete message was read")]
    Truncated,
    #[error("unknown message discriminant: {0}")]
    UnknownDiscriminant(u8),
    #[error("string payload was not valid UTF-8")]
    InvalidUtf8,
}

/// The endpoint was reachable at some point but has now failed; not retried
/// by the [`crate::connector::Connector`].
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ConnectError {
    pub message: String,
    pub diagnostics: Option<Diagnostics>,
}

impl ConnectError {
    pub fn new(message: impl Into<String>, diagnostics: Diagnostics) -> Self {
        ConnectError {
            message: message.into(),
            diagnostics: Some(diagnostics),
        }
    }

    /// A `ConnectError` with no diagnostics attached, for failures raised
    /// before a daemon identity is even known (e.g. a closed connection).
    pub fn bare(message: impl Into<String>) -> Self {
        ConnectError {
            message: message.into(),
            diagnostics: None,
        }
    }
}

/// The endpoint recorded in the registry no longer points at a live daemon.
/// The [`crate::connector::Connector`] evicts it and retries.
#[derive(Debug, thiserror::Error)]
#[error("daemon {daemon_id} is at a stale address")]
pub struct StaleAddress {
    pub daemon_id: DaemonId,
    pub diagnostics: Diagnostics,
}

/// The calling thread was interrupted while blocked on a queue operation.
#[derive(Debug, thiserror::Error)]
#[error("interrupted: {0}")]
pub struct Interrupted(pub String);

/// The unified failure surface of [`crate::connection::Connection`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Stale(#[from] StaleAddress),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}
