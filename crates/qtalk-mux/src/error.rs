//! Error types for the qmux layer.

use core::fmt;
use std::sync::Arc;

/// Errors produced by sessions and channels.
///
/// `Closed` doubles as the "clean end of transport" result: a peer that hangs
/// up mid-session surfaces as `Closed` from `Session::wait`, not as an I/O
/// error.
#[derive(Debug, Clone)]
pub enum MuxError {
    /// The session (or its transport) is closed.
    Closed,
    /// The channel has been closed locally; no further writes are possible.
    ChannelClosed,
    /// The remote side rejected a channel open.
    OpenFailed,
    /// The peer violated the protocol; the session is torn down.
    Protocol(String),
    /// An I/O error on the underlying transport.
    Io(Arc<std::io::Error>),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::OpenFailed => write!(f, "channel open failed on remote side"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MuxError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}
