//! qtalk-mux: channel-multiplexed sessions over any ordered bytestream.
//!
//! qmux layers many independent, flow-controlled logical streams over a
//! single reliable transport (a TCP connection, a unix socket, an in-memory
//! duplex). Either side can open channels; each channel is a windowed
//! bidirectional byte stream with half-close.
//!
//! ```ignore
//! let session = qtalk_mux::Session::new(tcp_stream);
//! let ch = session.open().await?;
//! ch.write(b"hello").await?;
//! ch.close().await?;
//! ```
//!
//! The session owns its transport and runs a single read loop; see
//! [`Session`] for the accept/open handshake and shutdown semantics.

#![forbid(unsafe_code)]

mod channel;
mod error;
pub mod frame;
mod listener;
mod session;
mod stream;

pub use channel::{Channel, Direction};
pub use error::MuxError;
pub use frame::{CHANNEL_MAX_PACKET, CHANNEL_WINDOW_SIZE, MAX_PACKET_LENGTH, MIN_PACKET_LENGTH};
pub use listener::{dial, Listener};
pub use session::{Session, DEFAULT_ACCEPT_TIMEOUT};
pub use stream::ChannelStream;
