//! Typed handler adaptors.
//!
//! Builds [`Handler`]s from plain closures: the adaptor decodes the framed
//! argument value into the closure's parameter type, invokes it, and returns
//! either the value or the error message. Callers of these handlers send
//! their arguments as one encodable value (an array for multi-argument
//! functions; see [`Args`]).

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use qtalk_codec::Codec;
use qtalk_rpc::{Call, Handler, HandlerFunc, Responder};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The conventional argument value for adaptor-based handlers: a JSON-style
/// array of values. Use a more specific type when every argument has the
/// same shape.
pub type Args = Vec<serde_json::Value>;

/// Build a handler from a synchronous function of the decoded arguments.
///
/// ```ignore
/// peer.handle("/add", handler_fn(|(a, b): (i64, i64)| Ok::<_, String>(a + b)));
/// ```
pub fn handler_fn<C, A, R, E, F>(f: F) -> impl Handler<C>
where
    C: Codec,
    F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + Sync + 'static,
    E: Display + Send + 'static,
{
    let f = Arc::new(f);
    HandlerFunc(move |resp: Responder<C>, call: Call<C>| {
        let f = f.clone();
        async move {
            let args: A = match call.receive().await {
                Ok(args) => args,
                Err(e) => {
                    finish_err(&resp, format!("args: {e}")).await;
                    return;
                }
            };
            match f(args) {
                Ok(value) => finish_ok(&resp, value).await,
                Err(e) => finish_err(&resp, e.to_string()).await,
            }
        }
    })
}

/// Build a handler from an async function that also receives the [`Call`],
/// for handlers that stream further arguments or call back to the peer.
pub fn handler_call_fn<C, A, R, E, F, Fut>(f: F) -> impl Handler<C>
where
    C: Codec,
    F: Fn(A, Call<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + Sync + 'static,
    E: Display + Send + 'static,
{
    let f = Arc::new(f);
    HandlerFunc(move |resp: Responder<C>, call: Call<C>| {
        let f = f.clone();
        async move {
            let args: A = match call.receive().await {
                Ok(args) => args,
                Err(e) => {
                    finish_err(&resp, format!("args: {e}")).await;
                    return;
                }
            };
            match f(args, call).await {
                Ok(value) => finish_ok(&resp, value).await,
                Err(e) => finish_err(&resp, e.to_string()).await,
            }
        }
    })
}

async fn finish_ok<C: Codec, R: Serialize + Send + Sync>(resp: &Responder<C>, value: R) {
    if let Err(e) = resp.ret((value,)).await {
        tracing::debug!(error = %e, "return failed");
    }
}

async fn finish_err<C: Codec>(resp: &Responder<C>, message: String) {
    if let Err(e) = resp.ret_err(message).await {
        tracing::debug!(error = %e, "error return failed");
    }
}
