//! The responding side of an RPC exchange.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use qtalk_codec::Codec;
use qtalk_mux::{Channel, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::RpcError;
use crate::framing::FramedChannel;
use crate::mux::clean_selector;
use crate::proto::{CallHeader, ResponseHeader};

/// Boxed future type for object-safe handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Services one call on one channel.
///
/// A handler that returns without responding gets an empty return issued on
/// its behalf, and the channel is closed unless the response was continued.
pub trait Handler<C: Codec>: Send + Sync {
    fn respond(&self, resp: Responder<C>, call: Call<C>) -> BoxFuture<'static, ()>;
}

impl<C: Codec, H: Handler<C> + ?Sized> Handler<C> for Arc<H> {
    fn respond(&self, resp: Responder<C>, call: Call<C>) -> BoxFuture<'static, ()> {
        (**self).respond(resp, call)
    }
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFunc<F>(pub F);

impl<C, F, Fut> Handler<C> for HandlerFunc<F>
where
    C: Codec,
    F: Fn(Responder<C>, Call<C>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn respond(&self, resp: Responder<C>, call: Call<C>) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(resp, call))
    }
}

/// The responding side's view of one call.
///
/// Carries a [`Client`] bound to the same session so handlers can call back
/// to the originator while servicing a request.
pub struct Call<C: Codec> {
    selector: String,
    caller: Client<C>,
    fc: FramedChannel<C>,
    cancel: CancellationToken,
}

impl<C: Codec> Call<C> {
    /// The normalized selector this call was dispatched with.
    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// A caller for making calls back to the calling side.
    pub fn caller(&self) -> &Client<C> {
        &self.caller
    }

    /// The ambient cancellation token the server was started with.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn channel(&self) -> &Channel {
        self.fc.channel()
    }

    /// Decode one incoming argument value. Call repeatedly when the caller
    /// streams multiple values.
    pub async fn receive<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        self.fc.recv().await
    }

    /// Read and throw away one argument value.
    pub async fn discard(&self) -> Result<(), RpcError> {
        self.fc.discard().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RespondState {
    Unresponded,
    Returned,
    Continued,
}

/// Initiates the response for one call.
///
/// State machine: `ret`/`ret_err` move to returned and close the channel;
/// `continue_with` moves to continued and leaves the channel open (the
/// handler becomes responsible for closing it); `send` is only valid after
/// `continue_with`.
#[derive(Clone)]
pub struct Responder<C: Codec> {
    inner: Arc<ResponderInner<C>>,
}

struct ResponderInner<C: Codec> {
    fc: FramedChannel<C>,
    state: Mutex<RespondState>,
}

/// Reply values sent after the response header, one framed value each. The
/// unit impl sends a single nil, so at least one framed value always follows
/// the header.
pub trait ReturnValues<C: Codec>: Send {
    fn send_all(
        self,
        fc: &FramedChannel<C>,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;
}

impl<C: Codec> ReturnValues<C> for () {
    async fn send_all(self, fc: &FramedChannel<C>) -> Result<(), RpcError> {
        fc.send(&()).await
    }
}

macro_rules! impl_return_values {
    ($(($T:ident, $v:ident)),+) => {
        impl<C: Codec, $($T: Serialize + Send + Sync),+> ReturnValues<C> for ($($T,)+) {
            async fn send_all(self, fc: &FramedChannel<C>) -> Result<(), RpcError> {
                let ($($v,)+) = self;
                $(fc.send(&$v).await?;)+
                Ok(())
            }
        }
    };
}

impl_return_values!((V1, v1));
impl_return_values!((V1, v1), (V2, v2));
impl_return_values!((V1, v1), (V2, v2), (V3, v3));
impl_return_values!((V1, v1), (V2, v2), (V3, v3), (V4, v4));

impl<C: Codec> Responder<C> {
    fn new(fc: FramedChannel<C>) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                fc,
                state: Mutex::new(RespondState::Unresponded),
            }),
        }
    }

    /// Send a return and close the channel.
    pub async fn ret<V: ReturnValues<C>>(&self, values: V) -> Result<(), RpcError> {
        self.respond(None, values, false).await
    }

    /// Send an error return and close the channel. The error message rides
    /// in the response header; a single nil reply value follows it.
    pub async fn ret_err(&self, message: impl Into<String>) -> Result<(), RpcError> {
        self.respond(Some(message.into()), (), false).await
    }

    /// Send a return but keep the channel open for further framed exchange.
    /// The handler becomes responsible for closing the channel.
    pub async fn continue_with<V: ReturnValues<C>>(&self, values: V) -> Result<(), RpcError> {
        self.respond(None, values, true).await
    }

    /// Send an error return but keep the channel open. The error message
    /// rides in the response header and a single nil reply value follows
    /// it; the handler keeps responsibility for the channel.
    pub async fn continue_err(&self, message: impl Into<String>) -> Result<(), RpcError> {
        self.respond(Some(message.into()), (), true).await
    }

    /// Encode a value over the channel. Valid only after `continue_with`.
    pub async fn send<T: Serialize + ?Sized>(&self, v: &T) -> Result<(), RpcError> {
        if *self.inner.state.lock() != RespondState::Continued {
            return Err(RpcError::NotContinued);
        }
        self.inner.fc.send(v).await
    }

    pub fn channel(&self) -> &Channel {
        self.inner.fc.channel()
    }

    fn has_responded(&self) -> bool {
        *self.inner.state.lock() != RespondState::Unresponded
    }

    fn is_continued(&self) -> bool {
        *self.inner.state.lock() == RespondState::Continued
    }

    async fn respond<V: ReturnValues<C>>(
        &self,
        error: Option<String>,
        values: V,
        continue_: bool,
    ) -> Result<(), RpcError> {
        {
            let mut state = self.inner.state.lock();
            if *state != RespondState::Unresponded {
                return Err(RpcError::AlreadyResponded);
            }
            *state = if continue_ {
                RespondState::Continued
            } else {
                RespondState::Returned
            };
        }

        let header = ResponseHeader { error, continue_ };
        self.inner.fc.send(&header).await?;
        values.send_all(&self.inner.fc).await?;

        if !continue_ {
            self.inner.fc.channel().close().await?;
        }
        Ok(())
    }
}

/// Responds to calls accepted on a session with a handler and codec.
pub struct Server<C: Codec> {
    handler: Arc<dyn Handler<C>>,
    codec: C,
}

impl<C: Codec> Clone for Server<C> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> Server<C> {
    pub fn new(handler: impl Handler<C> + 'static, codec: C) -> Self {
        Self {
            handler: Arc::new(handler),
            codec,
        }
    }

    /// Accept channels until the session closes, servicing each call in its
    /// own task. `cancel` becomes the ambient cancellation of every call.
    pub async fn respond(&self, session: &Session, cancel: CancellationToken) {
        loop {
            let ch = match session.accept().await {
                Ok(ch) => ch,
                Err(_) => return,
            };
            tokio::spawn(respond_channel(
                self.handler.clone(),
                session.clone(),
                self.codec.clone(),
                ch,
                cancel.clone(),
            ));
        }
    }

    /// Accept sessions until the listener fails, responding to each in its
    /// own task.
    pub async fn serve(&self, listener: &qtalk_mux::Listener) -> std::io::Result<()> {
        loop {
            let session = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.respond(&session, CancellationToken::new()).await;
            });
        }
    }
}

/// Service one call on a freshly accepted channel.
async fn respond_channel<C: Codec>(
    handler: Arc<dyn Handler<C>>,
    session: Session,
    codec: C,
    ch: Channel,
    cancel: CancellationToken,
) {
    let fc = FramedChannel::new(ch.clone(), codec.clone());

    let header: CallHeader = match fc.recv().await {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!(channel_id = ch.id(), error = %e, "aborting call: bad header");
            let _ = ch.close().await;
            return;
        }
    };

    let selector = clean_selector(&header.selector);
    tracing::debug!(selector = %selector, channel_id = ch.id(), "dispatching call");

    let call = Call {
        selector,
        caller: Client::new(session, codec),
        fc: fc.clone(),
        cancel,
    };
    let responder = Responder::new(fc);

    // A panicking handler must not leave the caller hanging.
    let served = AssertUnwindSafe(handler.respond(responder.clone(), call))
        .catch_unwind()
        .await;
    if let Err(panic) = served {
        let message = panic_message(panic);
        tracing::warn!(message = %message, "handler panicked");
        let _ = responder.ret_err(format!("panic: {message}")).await;
    }

    if !responder.has_responded() {
        let _ = responder.ret(()).await;
    }
    if !responder.is_continued() {
        let _ = ch.close().await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
