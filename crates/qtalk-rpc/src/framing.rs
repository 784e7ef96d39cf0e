//! Length-prefixed value framing over a channel.
//!
//! Each framed value is a `u32` big-endian byte count followed by that many
//! bytes of codec output. The framing makes value boundaries explicit so
//! receivers can skip payloads they do not want, whether or not the codec is
//! self-delimiting.

use qtalk_codec::Codec;
use qtalk_mux::{Channel, MuxError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::RpcError;

/// A channel carrying discrete codec-encoded values.
pub struct FramedChannel<C: Codec> {
    ch: Channel,
    codec: C,
}

impl<C: Codec> Clone for FramedChannel<C> {
    fn clone(&self) -> Self {
        Self {
            ch: self.ch.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> FramedChannel<C> {
    pub fn new(ch: Channel, codec: C) -> Self {
        Self { ch, codec }
    }

    pub fn channel(&self) -> &Channel {
        &self.ch
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Encode `v` and write it as one framed value.
    pub async fn send<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), RpcError> {
        let encoded = self.codec.encode(v)?;
        let mut framed = Vec::with_capacity(4 + encoded.len());
        framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        framed.extend_from_slice(&encoded);
        self.ch.write(&framed).await?;
        Ok(())
    }

    /// Read one framed value and decode it.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let buf = self.recv_raw().await?;
        Ok(self.codec.decode(&buf)?)
    }

    /// Read one framed value without decoding it.
    pub async fn recv_raw(&self) -> Result<Vec<u8>, RpcError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read one framed value and throw it away.
    pub async fn discard(&self) -> Result<(), RpcError> {
        self.recv_raw().await.map(drop)
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), RpcError> {
        self.ch.read_exact(buf).await.map_err(|e| match e {
            MuxError::Closed => RpcError::UnexpectedEof,
            other => RpcError::Mux(other),
        })
    }
}
