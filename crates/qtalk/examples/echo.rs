//! Echo service over TCP: serves `/echo` on one task and calls it from
//! another.
//!
//! ```text
//! cargo run --example echo
//! ```

use qtalk::{handler_fn, CallArgs, CancellationToken, JsonCodec};
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = qtalk::Listener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mux: qtalk::RespondMux<JsonCodec> = qtalk::RespondMux::new();
    mux.handle("/echo", handler_fn(|v: Value| Ok::<_, String>(v)));
    tokio::spawn(async move {
        let _ = qtalk::serve_tcp(&listener, JsonCodec, mux).await;
    });

    let peer = qtalk::dial_tcp(addr, JsonCodec).await?;
    let resp = peer
        .call::<_, (Value,)>(
            CancellationToken::new(),
            "/echo",
            CallArgs::value(json!({"hello": "qtalk"})),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&resp.reply.0)?);

    peer.close().await?;
    Ok(())
}
