//! RPC error types.

use core::fmt;

use qtalk_codec::CodecError;
use qtalk_mux::MuxError;

/// Errors produced by callers and responders.
#[derive(Debug, Clone)]
pub enum RpcError {
    /// The remote handler returned an error string in its response header.
    Remote(String),
    /// A session or channel failure underneath the call.
    Mux(MuxError),
    /// A value failed to encode or decode.
    Codec(CodecError),
    /// The call's cancellation token fired.
    Cancelled,
    /// The channel ended in the middle of a framed value.
    UnexpectedEof,
    /// `ret`/`continue_with` was called twice on one responder.
    AlreadyResponded,
    /// `send` on a responder that has not continued.
    NotContinued,
}

impl RpcError {
    /// The remote handler's error message, if this is a remote error.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(msg) => Some(msg),
            _ => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(msg) => write!(f, "remote error: {msg}"),
            Self::Mux(e) => write!(f, "{e}"),
            Self::Codec(e) => write!(f, "{e}"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::UnexpectedEof => write!(f, "unexpected end of channel"),
            Self::AlreadyResponded => write!(f, "response already initiated"),
            Self::NotContinued => write!(f, "send requires a continued response"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mux(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MuxError> for RpcError {
    fn from(e: MuxError) -> Self {
        Self::Mux(e)
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
