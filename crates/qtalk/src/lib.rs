//! qtalk: bidirectional RPC over qmux stream multiplexing.
//!
//! A qtalk endpoint layers three things over any reliable ordered
//! bytestream:
//!
//! - a [`mux`] session multiplexing flow-controlled channels,
//! - an [`rpc`] caller/responder pair exchanging length-prefixed codec
//!   values on those channels,
//! - a [`Peer`] tying both ends together so either side can make and
//!   service calls on the same transport.
//!
//! ```ignore
//! let (alice, bob) = qtalk::pair(JsonCodec);
//! bob.handle("/add", handler_fn(|(a, b): (i64, i64)| Ok::<_, String>(a + b)));
//! let bob2 = bob.clone();
//! tokio::spawn(async move { bob2.respond().await });
//!
//! let resp = alice
//!     .call::<_, (i64,)>(CancellationToken::new(), "/add", CallArgs::value((2, 3)))
//!     .await?;
//! assert_eq!(resp.reply.0, 5);
//! ```

#![forbid(unsafe_code)]

mod handler;
mod peer;

pub use qtalk_codec as codec;
pub use qtalk_mux as mux;
pub use qtalk_rpc as rpc;

pub use qtalk_codec::{Codec, CodecError, JsonCodec};
pub use qtalk_mux::{Channel, ChannelStream, Listener, MuxError, Session};
pub use qtalk_rpc::{
    CallArgs, Caller, Call, Client, Handler, HandlerFunc, Replies, RespondMux, Responder,
    Response, ReturnValues, RpcError, Server,
};

pub use handler::{handler_call_fn, handler_fn, Args};
pub use peer::{dial_tcp, pair, serve_tcp, Peer};

// The cancellation type every call takes; re-exported so callers need not
// depend on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
