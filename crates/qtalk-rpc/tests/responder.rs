//! Responder state machine behavior, observed through the wire.

use std::time::Duration;

use qtalk_codec::JsonCodec;
use qtalk_mux::Session;
use qtalk_rpc::{
    Call, CallArgs, CallHeader, Client, FramedChannel, HandlerFunc, Responder, ResponseHeader,
    RpcError, Server,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Start a server with the given handler and return a client for it.
fn rpc_pair(handler: impl qtalk_rpc::Handler<JsonCodec> + 'static) -> Client<JsonCodec> {
    let (a, b) = tokio::io::duplex(1 << 20);
    let (client_session, server_session) = (Session::new(a), Session::new(b));
    let server = Server::new(handler, JsonCodec);
    tokio::spawn(async move {
        server
            .respond(&server_session, CancellationToken::new())
            .await;
    });
    Client::new(client_session, JsonCodec)
}

fn cx() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn send_requires_continue() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client = rpc_pair(HandlerFunc(
        move |resp: Responder<JsonCodec>, call: Call<JsonCodec>| {
            let seen_tx = seen_tx.clone();
            async move {
                call.discard().await.expect("args");
                let premature = resp.send("early").await;
                let _ = seen_tx.send(matches!(premature, Err(RpcError::NotContinued)));
                resp.ret(("done",)).await.expect("ret");
            }
        },
    ));

    let resp = timeout(WAIT, client.call::<_, (String,)>(cx(), "/x", CallArgs::nil()))
        .await
        .expect("call timed out")
        .expect("call");
    assert_eq!(resp.reply.0, "done");
    assert!(seen_rx.recv().await.expect("signal"));
}

#[tokio::test]
async fn responding_twice_is_an_error() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client = rpc_pair(HandlerFunc(
        move |resp: Responder<JsonCodec>, call: Call<JsonCodec>| {
            let seen_tx = seen_tx.clone();
            async move {
                call.discard().await.expect("args");
                resp.ret(("first",)).await.expect("ret");
                let second = resp.ret(("second",)).await;
                let _ = seen_tx.send(matches!(second, Err(RpcError::AlreadyResponded)));
            }
        },
    ));

    let resp = timeout(WAIT, client.call::<_, (String,)>(cx(), "/x", CallArgs::nil()))
        .await
        .expect("call timed out")
        .expect("call");
    assert_eq!(resp.reply.0, "first");
    assert!(seen_rx.recv().await.expect("signal"));
}

#[tokio::test]
async fn send_after_continue_flows() {
    let client = rpc_pair(HandlerFunc(
        |resp: Responder<JsonCodec>, call: Call<JsonCodec>| async move {
            call.discard().await.expect("args");
            resp.continue_with((1i64,)).await.expect("continue");
            resp.send(&2i64).await.expect("send");
            resp.send(&3i64).await.expect("send");
        },
    ));

    let resp = timeout(WAIT, client.call::<_, (i64,)>(cx(), "/x", CallArgs::nil()))
        .await
        .expect("call timed out")
        .expect("call");
    assert_eq!(resp.reply.0, 1);
    let two: i64 = resp.recv().await.expect("recv");
    let three: i64 = resp.recv().await.expect("recv");
    assert_eq!((two, three), (2, 3));
    resp.close().await.expect("close");
}

#[tokio::test]
async fn continue_with_error_keeps_channel_open() {
    let client = rpc_pair(HandlerFunc(
        |resp: Responder<JsonCodec>, call: Call<JsonCodec>| async move {
            call.discard().await.expect("args");
            resp.continue_err("partial failure").await.expect("continue");
            resp.send("detail").await.expect("send");
        },
    ));

    // Speak the framing directly so the post-error channel state is
    // observable.
    let ch = client.session().open().await.expect("open");
    let fc = FramedChannel::new(ch, JsonCodec);
    fc.send(&CallHeader {
        selector: "/x".into(),
    })
    .await
    .expect("header");
    fc.send(&()).await.expect("args");

    let header: ResponseHeader = fc.recv().await.expect("response header");
    assert_eq!(header.error.as_deref(), Some("partial failure"));
    assert!(header.continue_);

    // The substituted nil reply value, then a value sent after the error
    // header: the channel is still open.
    fc.discard().await.expect("nil value");
    let detail: String = timeout(WAIT, fc.recv())
        .await
        .expect("recv timed out")
        .expect("recv");
    assert_eq!(detail, "detail");
    fc.channel().close().await.expect("close");
}

#[tokio::test]
async fn continued_error_surfaces_as_remote_error() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client = rpc_pair(HandlerFunc(
        move |resp: Responder<JsonCodec>, call: Call<JsonCodec>| {
            let seen_tx = seen_tx.clone();
            async move {
                call.discard().await.expect("args");
                resp.continue_err("boom").await.expect("continue");
                // The caller saw an error but did not close the continued
                // channel, so sends still flow.
                let _ = seen_tx.send(resp.send("after").await.is_ok());
            }
        },
    ));

    match timeout(WAIT, client.call::<_, ()>(cx(), "/x", CallArgs::nil()))
        .await
        .expect("call timed out")
    {
        Err(RpcError::Remote(message)) => assert_eq!(message, "boom"),
        other => panic!("expected remote error, got {other:?}"),
    }
    assert!(seen_rx.recv().await.expect("signal"));
}

#[tokio::test]
async fn selector_is_normalized_before_dispatch() {
    let client = rpc_pair(HandlerFunc(
        |resp: Responder<JsonCodec>, call: Call<JsonCodec>| async move {
            let selector = call.selector().to_string();
            call.discard().await.expect("args");
            resp.ret((selector,)).await.expect("ret");
        },
    ));

    let resp = timeout(
        WAIT,
        client.call::<_, (String,)>(cx(), "//weird///path//", CallArgs::nil()),
    )
    .await
    .expect("call timed out")
    .expect("call");
    assert_eq!(resp.reply.0, "/weird/path");
}
