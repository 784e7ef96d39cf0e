//! Symmetric RPC endpoints.
//!
//! Each end of a session can both make and service calls. A [`Peer`] bundles
//! the session, a codec, a handler multiplexer, and a caller into one
//! endpoint; a server's accepted calls carry a caller bound back to the same
//! session, so callbacks flow the other way on their own channels.

use qtalk_codec::Codec;
use qtalk_mux::{MuxError, Session};
use qtalk_rpc::{CallArgs, Caller, Client, Handler, Replies, RespondMux, Response, RpcError, Server};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::ToSocketAddrs;
use tokio_util::sync::CancellationToken;

/// A symmetric RPC endpoint on one session.
pub struct Peer<C: Codec> {
    session: Session,
    codec: C,
    mux: Arc<RespondMux<C>>,
    client: Client<C>,
}

impl<C: Codec> Clone for Peer<C> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            codec: self.codec.clone(),
            mux: self.mux.clone(),
            client: self.client.clone(),
        }
    }
}

impl<C: Codec> Peer<C> {
    pub fn new(session: Session, codec: C) -> Self {
        let client = Client::new(session.clone(), codec.clone());
        Self {
            session,
            codec,
            mux: Arc::new(RespondMux::new()),
            client,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn client(&self) -> &Client<C> {
        &self.client
    }

    /// Register a handler under a selector pattern.
    pub fn handle(&self, pattern: &str, handler: impl Handler<C> + 'static) {
        self.mux.handle(pattern, handler);
    }

    /// Accept and service calls until the session closes. Run this in its
    /// own task alongside outbound calls.
    pub async fn respond(&self) {
        self.respond_with(CancellationToken::new()).await;
    }

    /// Like [`Peer::respond`] with an ambient cancellation token attached to
    /// every call.
    pub async fn respond_with(&self, cancel: CancellationToken) {
        let server = Server::new(self.mux.clone(), self.codec.clone());
        server.respond(&self.session, cancel).await;
    }

    /// Perform one call on a fresh channel.
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
        self.client.call(cancel, selector, args).await
    }

    pub async fn close(&self) -> Result<(), MuxError> {
        self.session.close().await
    }

    pub async fn wait(&self) -> MuxError {
        self.session.wait().await
    }
}

impl<C: Codec> Caller<C> for Peer<C> {
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
        Peer::call(self, cancel, selector, args).await
    }
}

/// Two peers joined by an in-memory duplex, for tests and examples.
pub fn pair<C: Codec>(codec: C) -> (Peer<C>, Peer<C>) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (
        Peer::new(Session::new(a), codec.clone()),
        Peer::new(Session::new(b), codec),
    )
}

/// Connect to a TCP listener and return a peer over the new session.
pub async fn dial_tcp<C: Codec>(addr: impl ToSocketAddrs, codec: C) -> std::io::Result<Peer<C>> {
    Ok(Peer::new(qtalk_mux::dial(addr).await?, codec))
}

/// Serve a handler to every session accepted on the listener.
pub async fn serve_tcp<C: Codec>(
    listener: &qtalk_mux::Listener,
    codec: C,
    handler: impl Handler<C> + 'static,
) -> std::io::Result<()> {
    let server = Server::new(handler, codec);
    server.serve(listener).await
}
