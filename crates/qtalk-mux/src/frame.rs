//! Wire codec for qmux control and data messages.
//!
//! Every packet is a `u32` big-endian body length followed by the body: a
//! single type byte, then the variant's fields as big-endian `u32`s in
//! declaration order. `Data` additionally carries a length-prefixed payload.
//! The decoder returns one fully parsed message per call; encoding is serial
//! per direction (the session serializes writers).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MuxError;

/// Smallest legal packet: length prefix + type byte + one u32 field.
pub const MIN_PACKET_LENGTH: usize = 9;
/// Packets at or above this total size are rejected.
pub const MAX_PACKET_LENGTH: usize = 1 << 31;

/// Maximum number of payload bytes sent in a single `Data` packet (~16MB).
pub const CHANNEL_MAX_PACKET: u32 = 1 << 24;
/// Initial per-channel receive window. We follow OpenSSH here.
pub const CHANNEL_WINDOW_SIZE: u32 = 64 * CHANNEL_MAX_PACKET;

const MSG_CHANNEL_OPEN: u8 = 100;
const MSG_CHANNEL_OPEN_CONFIRM: u8 = 101;
const MSG_CHANNEL_OPEN_FAILURE: u8 = 102;
const MSG_CHANNEL_WINDOW_ADJUST: u8 = 103;
const MSG_CHANNEL_DATA: u8 = 104;
const MSG_CHANNEL_EOF: u8 = 105;
const MSG_CHANNEL_CLOSE: u8 = 106;

/// A qmux frame message. Every variant except `Open` addresses a channel by
/// the id the *recipient* assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open {
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    OpenConfirm {
        channel_id: u32,
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    },
    OpenFailure {
        channel_id: u32,
    },
    WindowAdjust {
        channel_id: u32,
        additional_bytes: u32,
    },
    Data {
        channel_id: u32,
        payload: Bytes,
    },
    Eof {
        channel_id: u32,
    },
    Close {
        channel_id: u32,
    },
}

impl Message {
    /// The channel this message is addressed to, or `None` for `Open`.
    pub fn channel_id(&self) -> Option<u32> {
        match self {
            Message::Open { .. } => None,
            Message::OpenConfirm { channel_id, .. }
            | Message::OpenFailure { channel_id }
            | Message::WindowAdjust { channel_id, .. }
            | Message::Data { channel_id, .. }
            | Message::Eof { channel_id }
            | Message::Close { channel_id } => Some(*channel_id),
        }
    }
}

/// Writes messages to one direction of the transport.
pub struct Encoder<W> {
    w: W,
}

impl<W: AsyncWrite + Unpin> Encoder<W> {
    pub fn new(w: W) -> Self {
        Self { w }
    }

    /// Encode and flush one message.
    pub async fn encode(&mut self, msg: &Message) -> Result<(), MuxError> {
        let mut body = BytesMut::with_capacity(32);
        match msg {
            Message::Open {
                sender_id,
                window_size,
                max_packet_size,
            } => {
                body.put_u8(MSG_CHANNEL_OPEN);
                body.put_u32(*sender_id);
                body.put_u32(*window_size);
                body.put_u32(*max_packet_size);
            }
            Message::OpenConfirm {
                channel_id,
                sender_id,
                window_size,
                max_packet_size,
            } => {
                body.put_u8(MSG_CHANNEL_OPEN_CONFIRM);
                body.put_u32(*channel_id);
                body.put_u32(*sender_id);
                body.put_u32(*window_size);
                body.put_u32(*max_packet_size);
            }
            Message::OpenFailure { channel_id } => {
                body.put_u8(MSG_CHANNEL_OPEN_FAILURE);
                body.put_u32(*channel_id);
            }
            Message::WindowAdjust {
                channel_id,
                additional_bytes,
            } => {
                body.put_u8(MSG_CHANNEL_WINDOW_ADJUST);
                body.put_u32(*channel_id);
                body.put_u32(*additional_bytes);
            }
            Message::Data {
                channel_id,
                payload,
            } => {
                body.reserve(9 + payload.len());
                body.put_u8(MSG_CHANNEL_DATA);
                body.put_u32(*channel_id);
                body.put_u32(payload.len() as u32);
                body.extend_from_slice(payload);
            }
            Message::Eof { channel_id } => {
                body.put_u8(MSG_CHANNEL_EOF);
                body.put_u32(*channel_id);
            }
            Message::Close { channel_id } => {
                body.put_u8(MSG_CHANNEL_CLOSE);
                body.put_u32(*channel_id);
            }
        }

        if body.len() + 4 >= MAX_PACKET_LENGTH {
            return Err(MuxError::Protocol(format!(
                "outgoing packet too large: {} bytes",
                body.len() + 4
            )));
        }

        self.w.write_all(&(body.len() as u32).to_be_bytes()).await?;
        self.w.write_all(&body).await?;
        self.w.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the transport.
    pub async fn shutdown(&mut self) -> Result<(), MuxError> {
        self.w.shutdown().await?;
        Ok(())
    }
}

/// Reads messages from one direction of the transport.
pub struct Decoder<R> {
    r: R,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    pub fn new(r: R) -> Self {
        Self { r }
    }

    /// Decode the next message. A clean end of stream before the length
    /// prefix surfaces as [`MuxError::Closed`]; anywhere else it is an error.
    pub async fn decode(&mut self) -> Result<Message, MuxError> {
        let mut len_buf = [0u8; 4];
        if let Err(e) = self.r.read_exact(&mut len_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(MuxError::Closed);
            }
            return Err(e.into());
        }

        let body_len = u32::from_be_bytes(len_buf) as usize;
        if body_len + 4 < MIN_PACKET_LENGTH || body_len + 4 >= MAX_PACKET_LENGTH {
            return Err(MuxError::Protocol(format!(
                "invalid packet length: {}",
                body_len + 4
            )));
        }

        let mut body = vec![0u8; body_len];
        self.r.read_exact(&mut body).await?;
        parse(&body)
    }
}

fn parse(body: &[u8]) -> Result<Message, MuxError> {
    let ty = body[0];
    let mut fields = &body[1..];

    let msg = match ty {
        MSG_CHANNEL_OPEN => Message::Open {
            sender_id: take_u32(&mut fields)?,
            window_size: take_u32(&mut fields)?,
            max_packet_size: take_u32(&mut fields)?,
        },
        MSG_CHANNEL_OPEN_CONFIRM => Message::OpenConfirm {
            channel_id: take_u32(&mut fields)?,
            sender_id: take_u32(&mut fields)?,
            window_size: take_u32(&mut fields)?,
            max_packet_size: take_u32(&mut fields)?,
        },
        MSG_CHANNEL_OPEN_FAILURE => Message::OpenFailure {
            channel_id: take_u32(&mut fields)?,
        },
        MSG_CHANNEL_WINDOW_ADJUST => Message::WindowAdjust {
            channel_id: take_u32(&mut fields)?,
            additional_bytes: take_u32(&mut fields)?,
        },
        MSG_CHANNEL_DATA => {
            let channel_id = take_u32(&mut fields)?;
            let len = take_u32(&mut fields)? as usize;
            if fields.len() != len {
                return Err(MuxError::Protocol(format!(
                    "data payload length mismatch: declared {len}, got {}",
                    fields.len()
                )));
            }
            let payload = Bytes::copy_from_slice(fields);
            fields = &[];
            Message::Data {
                channel_id,
                payload,
            }
        }
        MSG_CHANNEL_EOF => Message::Eof {
            channel_id: take_u32(&mut fields)?,
        },
        MSG_CHANNEL_CLOSE => Message::Close {
            channel_id: take_u32(&mut fields)?,
        },
        other => {
            return Err(MuxError::Protocol(format!("unknown message type {other}")));
        }
    };

    if !fields.is_empty() {
        return Err(MuxError::Protocol(format!(
            "trailing bytes after message type {ty}"
        )));
    }
    Ok(msg)
}

fn take_u32(fields: &mut &[u8]) -> Result<u32, MuxError> {
    if fields.len() < 4 {
        return Err(MuxError::Protocol("truncated message".into()));
    }
    let (head, rest) = fields.split_at(4);
    *fields = rest;
    Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
}
