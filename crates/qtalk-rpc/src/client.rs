//! The calling side of an RPC exchange.

use std::future::Future;

use qtalk_codec::Codec;
use qtalk_mux::{Channel, ChannelStream, MuxError, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::framing::FramedChannel;
use crate::proto::{CallHeader, ResponseHeader};

/// Arguments for a call: either a single value or a lazy sequence of values
/// streamed from another task. Each produced value is sent as its own framed
/// value; the call still blocks until the responder replies.
pub enum CallArgs<A> {
    Value(A),
    Stream(mpsc::Receiver<A>),
}

impl<A> CallArgs<A> {
    pub fn value(v: A) -> Self {
        Self::Value(v)
    }

    pub fn stream(rx: mpsc::Receiver<A>) -> Self {
        Self::Stream(rx)
    }
}

impl CallArgs<()> {
    /// No arguments: a single framed nil is still sent.
    pub fn nil() -> Self {
        Self::Value(())
    }
}

/// Decodes the reply values of a response, one framed value per tuple
/// position. The unit impl discards a single framed value, since a reply
/// always carries at least one.
pub trait Replies<C: Codec>: Sized + Send {
    fn decode(
        fc: &FramedChannel<C>,
    ) -> impl Future<Output = Result<Self, RpcError>> + Send;
}

impl<C: Codec> Replies<C> for () {
    async fn decode(fc: &FramedChannel<C>) -> Result<Self, RpcError> {
        fc.discard().await
    }
}

macro_rules! impl_replies {
    ($($T:ident),+) => {
        impl<C: Codec, $($T: DeserializeOwned + Send),+> Replies<C> for ($($T,)+) {
            async fn decode(fc: &FramedChannel<C>) -> Result<Self, RpcError> {
                Ok(($(fc.recv::<$T>().await?,)+))
            }
        }
    };
}

impl_replies!(R1);
impl_replies!(R1, R2);
impl_replies!(R1, R2, R3);
impl_replies!(R1, R2, R3, R4);

/// Anything able to perform remote calls.
pub trait Caller<C: Codec>: Send + Sync {
    fn call<A, R>(
        &self,
        cancel: CancellationToken,
        selector: &str,
        args: CallArgs<A>,
    ) -> impl Future<Output = Result<Response<R, C>, RpcError>> + Send
    where
        A: Serialize + Send + Sync + 'static,
        R: Replies<C>;
}

/// A caller bound to one session and codec.
pub struct Client<C: Codec> {
    session: Session,
    codec: C,
}

impl<C: Codec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> Client<C> {
    pub fn new(session: Session, codec: C) -> Self {
        Self { session, codec }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Close the underlying session.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.session.close().await
    }

    /// Block until the session shuts down.
    pub async fn wait(&self) -> MuxError {
        self.session.wait().await
    }

    /// Open a channel and perform one call.
    ///
    /// Cancellation translates to a transport-level abort: when `cancel`
    /// fires before completion, the channel is closed and the call returns
    /// [`RpcError::Cancelled`].
    pub async fn call<A, R>(
        &self,
        cancel: CancellationToken,
        selector: &str,
        args: CallArgs<A>,
    ) -> Result<Response<R, C>, RpcError>
    where
        A: Serialize + Send + Sync + 'static,
        R: Replies<C>,
    {
        let ch = tokio::select! {
            res = self.session.open() => res?,
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
        };

        let (done_tx, done_rx) = oneshot::channel::<()>();
        {
            let ch = ch.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ch.close().await;
                    }
                    _ = done_rx => {}
                }
            });
        }

        let fc = FramedChannel::new(ch, self.codec.clone());
        let res = run_call(&fc, selector, args).await;
        drop(done_tx);

        // The cancellation, not the abort it caused, is the interesting error.
        if cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        res
    }
}

impl<C: Codec> Caller<C> for Client<C> {
    async fn call<A, R>(
        &self,
        cancel: CancellationToken,
        selector: &str,
        args: CallArgs<A>,
    ) -> Result<Response<R, C>, RpcError>
    where
        A: Serialize + Send + Sync + 'static,
        R: Replies<C>,
    {
        Client::call(self, cancel, selector, args).await
    }
}

async fn run_call<A, R, C>(
    fc: &FramedChannel<C>,
    selector: &str,
    args: CallArgs<A>,
) -> Result<Response<R, C>, RpcError>
where
    A: Serialize + Send + Sync + 'static,
    R: Replies<C>,
    C: Codec,
{
    if let Err(e) = fc
        .send(&CallHeader {
            selector: selector.to_string(),
        })
        .await
    {
        return abort(fc, e).await;
    }

    let sent = match args {
        CallArgs::Value(v) => fc.send(&v).await,
        CallArgs::Stream(mut rx) => {
            let mut res = Ok(());
            while let Some(v) = rx.recv().await {
                if let Err(e) = fc.send(&v).await {
                    res = Err(e);
                    break;
                }
            }
            res
        }
    };
    if let Err(e) = sent {
        return abort(fc, e).await;
    }

    let header: ResponseHeader = match fc.recv().await {
        Ok(h) => h,
        Err(e) => return abort(fc, e).await,
    };

    // Once the header is in, closure follows the continue flag alone: a
    // continued response stays open even when it carries an error, and the
    // responder keeps responsibility for the channel.
    if let Some(message) = header.error.clone() {
        if !header.continue_ {
            let _ = fc.channel().close().await;
        }
        return Err(RpcError::Remote(message));
    }

    let reply = match R::decode(fc).await {
        Ok(r) => r,
        Err(e) => {
            if !header.continue_ {
                let _ = fc.channel().close().await;
            }
            return Err(e);
        }
    };

    if !header.continue_ {
        let _ = fc.channel().close().await;
    }

    Ok(Response {
        header,
        reply,
        framed: fc.clone(),
    })
}

/// Close the channel and surface the error that aborted the call.
async fn abort<C: Codec, T>(fc: &FramedChannel<C>, e: RpcError) -> Result<T, RpcError> {
    let _ = fc.channel().close().await;
    Err(e)
}

/// The calling side's view of a completed exchange.
///
/// When the header's `continue` flag is set, the channel is still open:
/// `send`/`recv` carry further framed values and the caller is responsible
/// for closing it.
pub struct Response<R, C: Codec> {
    pub header: ResponseHeader,
    pub reply: R,
    framed: FramedChannel<C>,
}

impl<R: std::fmt::Debug, C: Codec> std::fmt::Debug for Response<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("header", &self.header)
            .field("reply", &self.reply)
            .finish_non_exhaustive()
    }
}

impl<R, C: Codec> Response<R, C> {
    pub fn channel(&self) -> &Channel {
        self.framed.channel()
    }

    /// Encode a value over the underlying channel.
    pub async fn send<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), RpcError> {
        self.framed.send(v).await
    }

    /// Decode a value from the underlying channel.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.framed.recv().await
    }

    pub async fn close(&self) -> Result<(), RpcError> {
        self.framed.channel().close().await?;
        Ok(())
    }

    /// Take the continued channel as a raw byte stream.
    pub fn into_stream(self) -> ChannelStream {
        ChannelStream::new(self.framed.channel().clone())
    }
}
