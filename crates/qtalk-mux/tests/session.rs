//! Session-level behavior over in-memory transports, including raw-frame
//! conversations that exercise the wire protocol directly.

use std::time::Duration;

use qtalk_mux::frame::{Decoder, Encoder, Message};
use qtalk_mux::{MuxError, Session, CHANNEL_MAX_PACKET};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn session_pair() -> (Session, Session) {
    let (a, b) = tokio::io::duplex(1 << 20);
    (Session::new(a), Session::new(b))
}

/// Open a channel from `a` to `b`, returning both ends.
async fn open_pair(a: &Session, b: &Session) -> (qtalk_mux::Channel, qtalk_mux::Channel) {
    let opening = tokio::spawn({
        let a = a.clone();
        async move { a.open().await }
    });
    let b_ch = timeout(WAIT, b.accept()).await.expect("accept timed out").expect("accept");
    let a_ch = timeout(WAIT, opening).await.expect("open timed out").expect("task").expect("open");
    (a_ch, b_ch)
}

/// A raw protocol peer that speaks frames directly.
struct RawPeer<S> {
    enc: Encoder<WriteHalf<S>>,
    dec: Decoder<ReadHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawPeer<S> {
    fn new(transport: S) -> Self {
        let (r, w) = tokio::io::split(transport);
        Self {
            enc: Encoder::new(w),
            dec: Decoder::new(r),
        }
    }

    async fn send(&mut self, msg: Message) {
        self.enc.encode(&msg).await.expect("raw send");
    }

    async fn recv(&mut self) -> Message {
        timeout(WAIT, self.dec.decode())
            .await
            .expect("raw recv timed out")
            .expect("raw recv")
    }

    async fn expect_silence(&mut self, for_: Duration) {
        if let Ok(msg) = timeout(for_, self.dec.decode()).await {
            panic!("expected no frame, got {msg:?}");
        }
    }
}

#[tokio::test]
async fn open_accept_and_exchange() {
    let (a, b) = session_pair();

    let opened = tokio::spawn(async move {
        let ch = a.open().await.expect("open");
        ch.write(b"ping").await.expect("write");
        let mut buf = [0u8; 4];
        ch.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong");
        ch.close().await.expect("close");
    });

    let ch = timeout(WAIT, b.accept()).await.expect("accept timed out").expect("accept");
    let mut buf = [0u8; 4];
    ch.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"ping");
    ch.write(b"pong").await.expect("write");

    timeout(WAIT, opened).await.expect("exchange timed out").expect("task");
}

#[tokio::test]
async fn concurrent_channels_are_independent() {
    let (a, b) = session_pair();

    let server = tokio::spawn(async move {
        for _ in 0..3 {
            let ch = b.accept().await.expect("accept");
            tokio::spawn(async move {
                let mut buf = [0u8; 1];
                ch.read_exact(&mut buf).await.expect("read");
                ch.write(&[buf[0] + 1]).await.expect("write");
                ch.close().await.expect("close");
            });
        }
    });

    let mut handles = Vec::new();
    for i in 0u8..3 {
        let a = a.clone();
        handles.push(tokio::spawn(async move {
            let ch = a.open().await.expect("open");
            ch.write(&[i]).await.expect("write");
            let mut buf = [0u8; 1];
            ch.read_exact(&mut buf).await.expect("read");
            assert_eq!(buf[0], i + 1);
        }));
    }
    for h in handles {
        timeout(WAIT, h).await.expect("call timed out").expect("task");
    }
    timeout(WAIT, server).await.expect("server timed out").expect("task");
}

#[tokio::test]
async fn write_is_split_at_max_remote_payload() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Open {
        sender_id: 0,
        window_size: 1024,
        max_packet_size: 16,
    })
    .await;

    let ch = timeout(WAIT, sess.accept()).await.expect("accept timed out").expect("accept");
    match raw.recv().await {
        Message::OpenConfirm { channel_id: 0, .. } => {}
        other => panic!("expected open confirm, got {other:?}"),
    }

    ch.write(b"0123456789abcdefFEDCBA9876543210").await.expect("write");

    for expect in [b"0123456789abcdef".as_slice(), b"FEDCBA9876543210"] {
        match raw.recv().await {
            Message::Data { channel_id: 0, payload } => assert_eq!(&payload[..], expect),
            other => panic!("expected data, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn write_blocks_until_window_adjust() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Open {
        sender_id: 0,
        window_size: 4,
        max_packet_size: 1024,
    })
    .await;

    let ch = timeout(WAIT, sess.accept()).await.expect("accept timed out").expect("accept");
    let session_channel_id = match raw.recv().await {
        Message::OpenConfirm { sender_id, .. } => sender_id,
        other => panic!("expected open confirm, got {other:?}"),
    };

    let writer = tokio::spawn(async move { ch.write(b"12345678").await });

    match raw.recv().await {
        Message::Data { payload, .. } => assert_eq!(&payload[..], b"1234"),
        other => panic!("expected data, got {other:?}"),
    }
    // Window exhausted: the writer must be suspended now.
    raw.expect_silence(Duration::from_millis(100)).await;

    raw.send(Message::WindowAdjust {
        channel_id: session_channel_id,
        additional_bytes: 4,
    })
    .await;

    match raw.recv().await {
        Message::Data { payload, .. } => assert_eq!(&payload[..], b"5678"),
        other => panic!("expected data, got {other:?}"),
    }
    let n = timeout(WAIT, writer).await.expect("writer timed out").expect("task").expect("write");
    assert_eq!(n, 8);
}

#[tokio::test]
async fn close_is_idempotent_and_sends_one_close_frame() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Open {
        sender_id: 0,
        window_size: 1024,
        max_packet_size: 1024,
    })
    .await;
    let ch = timeout(WAIT, sess.accept()).await.expect("accept timed out").expect("accept");
    match raw.recv().await {
        Message::OpenConfirm { .. } => {}
        other => panic!("expected open confirm, got {other:?}"),
    }

    ch.close().await.expect("first close");
    ch.close().await.expect("second close");

    match raw.recv().await {
        Message::Close { channel_id: 0 } => {}
        other => panic!("expected close, got {other:?}"),
    }
    raw.expect_silence(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn late_frames_after_local_close_are_dropped() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Open {
        sender_id: 0,
        window_size: 1024,
        max_packet_size: 1024,
    })
    .await;
    let ch = timeout(WAIT, sess.accept()).await.expect("accept timed out").expect("accept");
    let session_channel_id = match raw.recv().await {
        Message::OpenConfirm { sender_id, .. } => sender_id,
        other => panic!("expected open confirm, got {other:?}"),
    };

    // Closing reclaims the table slot right away.
    ch.close().await.expect("close");
    assert_eq!(sess.num_channels(), 0);
    match raw.recv().await {
        Message::Close { channel_id: 0 } => {}
        other => panic!("expected close, got {other:?}"),
    }

    // The peer's own close and data already in flight arrive after the
    // slot is gone; both are dropped rather than treated as protocol
    // errors.
    raw.send(Message::Close {
        channel_id: session_channel_id,
    })
    .await;
    raw.send(Message::Data {
        channel_id: session_channel_id,
        payload: bytes::Bytes::from_static(b"late"),
    })
    .await;

    raw.send(Message::Open {
        sender_id: 1,
        window_size: 1024,
        max_packet_size: 1024,
    })
    .await;
    let accepted = tokio::spawn(async move { sess.accept().await });
    match raw.recv().await {
        Message::OpenConfirm { channel_id: 1, .. } => {}
        other => panic!("expected open confirm, got {other:?}"),
    }
    timeout(WAIT, accepted).await.expect("accept timed out").expect("task").expect("accept");
}

#[tokio::test]
async fn open_with_invalid_max_packet_size_is_rejected() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Open {
        sender_id: 3,
        window_size: 1024,
        max_packet_size: 5,
    })
    .await;
    match raw.recv().await {
        Message::OpenFailure { channel_id: 3 } => {}
        other => panic!("expected open failure, got {other:?}"),
    }

    // The session survives the rejection and no channel was created.
    assert_eq!(sess.num_channels(), 0);
    raw.send(Message::Open {
        sender_id: 4,
        window_size: 1024,
        max_packet_size: CHANNEL_MAX_PACKET,
    })
    .await;
    let accepted = tokio::spawn(async move { sess.accept().await });
    match raw.recv().await {
        Message::OpenConfirm { channel_id: 4, .. } => {}
        other => panic!("expected open confirm, got {other:?}"),
    }
    timeout(WAIT, accepted).await.expect("accept timed out").expect("task").expect("accept");
}

#[tokio::test]
async fn unaccepted_inbound_channel_is_rejected_after_timeout() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let _sess = Session::with_accept_timeout(transport, Duration::from_millis(100));
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Open {
        sender_id: 9,
        window_size: 1024,
        max_packet_size: 1024,
    })
    .await;
    match raw.recv().await {
        Message::OpenFailure { channel_id: 9 } => {}
        other => panic!("expected open failure, got {other:?}"),
    }
}

#[tokio::test]
async fn open_failure_surfaces_as_error() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    let opening = tokio::spawn(async move { sess.open().await });
    let sender_id = match raw.recv().await {
        Message::Open { sender_id, .. } => sender_id,
        other => panic!("expected open, got {other:?}"),
    };
    raw.send(Message::OpenFailure {
        channel_id: sender_id,
    })
    .await;

    match timeout(WAIT, opening).await.expect("open timed out").expect("task") {
        Err(MuxError::OpenFailed) => {}
        other => panic!("expected open-failed, got {other:?}"),
    }
}

#[tokio::test]
async fn half_close_still_allows_reads() {
    let (a, b) = session_pair();

    let peer = tokio::spawn(async move {
        let ch = b.accept().await.expect("accept");
        // Drain until EOF, then answer.
        let mut all = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = ch.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            all.extend_from_slice(&buf[..n]);
        }
        assert_eq!(all, b"request");
        ch.write(b"reply").await.expect("write");
        ch.close().await.expect("close");
    });

    let ch = a.open().await.expect("open");
    ch.write(b"request").await.expect("write");
    ch.close_write().await.expect("close_write");

    // Writes after half-close fail.
    match ch.write(b"more").await {
        Err(MuxError::ChannelClosed) => {}
        other => panic!("expected channel closed, got {other:?}"),
    }

    let mut buf = [0u8; 5];
    ch.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"reply");
    let n = timeout(WAIT, ch.read(&mut buf)).await.expect("eof timed out").expect("read");
    assert_eq!(n, 0);

    timeout(WAIT, peer).await.expect("peer timed out").expect("task");
}

#[tokio::test]
async fn read_after_remote_close_drains_pending() {
    let (a, b) = session_pair();

    let (a_ch, b_ch) = open_pair(&a, &b).await;
    a_ch.write(b"tail").await.expect("write");
    a_ch.close().await.expect("close");

    let mut buf = [0u8; 4];
    b_ch.read_exact(&mut buf).await.expect("read");
    assert_eq!(&buf, b"tail");
    let n = timeout(WAIT, b_ch.read(&mut buf)).await.expect("eof timed out").expect("read");
    assert_eq!(n, 0);
}

#[tokio::test]
async fn session_close_unblocks_everything() {
    let (a, b) = session_pair();

    let (a_ch, _b_ch) = open_pair(&a, &b).await;

    let blocked_accept = tokio::spawn({
        let a = a.clone();
        async move { a.accept().await }
    });
    let blocked_read = tokio::spawn({
        let a_ch = a_ch.clone();
        async move {
            let mut buf = [0u8; 1];
            a_ch.read(&mut buf).await
        }
    });

    a.close().await.expect("close");

    match timeout(WAIT, blocked_accept).await.expect("accept timed out").expect("task") {
        Err(MuxError::Closed) => {}
        other => panic!("expected closed, got {other:?}"),
    }
    let n = timeout(WAIT, blocked_read)
        .await
        .expect("read timed out")
        .expect("task")
        .expect("read after shutdown is EOF");
    assert_eq!(n, 0);

    match timeout(WAIT, a.wait()).await.expect("wait timed out") {
        MuxError::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }
    match a.open().await {
        Err(MuxError::Closed) => {}
        other => panic!("expected closed, got {other:?}"),
    }
}

#[tokio::test]
async fn transport_drop_terminates_session() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    drop(raw_transport);

    match timeout(WAIT, sess.wait()).await.expect("wait timed out") {
        MuxError::Closed => {}
        other => panic!("expected closed, got {other:?}"),
    }
}

#[tokio::test]
async fn frame_for_unknown_channel_is_a_protocol_error() {
    let (transport, raw_transport) = tokio::io::duplex(1 << 16);
    let sess = Session::new(transport);
    let mut raw = RawPeer::new(raw_transport);

    raw.send(Message::Data {
        channel_id: 42,
        payload: bytes::Bytes::from_static(b"stray"),
    })
    .await;

    match timeout(WAIT, sess.wait()).await.expect("wait timed out") {
        MuxError::Protocol(msg) => assert!(msg.contains("invalid channel")),
        other => panic!("expected protocol error, got {other:?}"),
    }
}
