//! qtalk-rpc: symmetric RPC on qmux channels.
//!
//! Either end of a session can make and service calls. A call opens a fresh
//! channel, sends a [`CallHeader`] and its argument values as length-prefixed
//! codec values, then decodes a [`ResponseHeader`] and the reply values. A
//! continued response leaves the channel open for arbitrary further framed
//! exchange.
//!
//! ```ignore
//! let client = Client::new(session, JsonCodec);
//! let resp = client
//!     .call::<_, (i64,)>(CancellationToken::new(), "/add", CallArgs::value((2, 3)))
//!     .await?;
//! assert_eq!(resp.reply.0, 5);
//! ```

#![forbid(unsafe_code)]

mod client;
mod error;
mod framing;
mod mux;
mod proto;
mod server;

pub use client::{CallArgs, Caller, Client, Replies, Response};
pub use error::RpcError;
pub use framing::FramedChannel;
pub use mux::{clean_selector, RespondMux};
pub use proto::{CallHeader, ResponseHeader};
pub use server::{BoxFuture, Call, Handler, HandlerFunc, Responder, ReturnValues, Server};
