//! Codec contract for qtalk.
//!
//! A codec turns one value at a time into bytes and back. Codecs need not be
//! self-delimiting: the RPC layer always wraps encoded values in
//! length-prefix framing, so the contract here is buffer-oriented.

#![forbid(unsafe_code)]

use core::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes and decodes single values.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Encode one value into a fresh buffer.
    fn encode<T: Serialize + ?Sized>(&self, v: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode one value from a buffer.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// Encode/decode failures.
#[derive(Debug, Clone)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// The JSON codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, v: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(v).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
