//! Flow-controlled bidirectional channels.
//!
//! A channel is a logical byte stream multiplexed within a session. Each
//! direction is governed by a byte window: `my_window` is what we are willing
//! to receive (replenished toward the peer with `WindowAdjust` as reads
//! consume it), `remote_window` is what the peer currently allows us to send.
//! Writers split data into packets no larger than the peer's advertised
//! maximum and suspend while the remote window is empty.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::MuxError;
use crate::frame::{Message, CHANNEL_MAX_PACKET, CHANNEL_WINDOW_SIZE};
use crate::session::{SessionCore, CHAN_SIZE};

/// Which side initiated the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Rendezvous outcome for an in-flight open, delivered on the channel's
/// control inbox by the session loop.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    Confirmed,
    Failed,
}

/// A bidirectional byte stream within a session.
///
/// `Channel` is a cheap cloneable handle; the session table, the RPC layer,
/// and user code may all hold one. Teardown is driven by the session: when
/// the session shuts down, every blocked read and write unblocks with
/// EOF/closed.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.inner.local_id)
            .field("direction", &self.inner.direction)
            .finish_non_exhaustive()
    }
}

struct ChannelInner {
    session: Arc<SessionCore>,
    local_id: u32,
    direction: Direction,
    remote_id: AtomicU32,
    /// Largest `Data` payload we accept from the peer.
    max_incoming_payload: u32,

    read: Mutex<ReadState>,
    readable: Notify,
    write: Mutex<WriteState>,
    writable: Notify,

    msg_tx: Mutex<Option<mpsc::Sender<ControlMsg>>>,
    msg_rx: Mutex<Option<mpsc::Receiver<ControlMsg>>>,
}

struct ReadState {
    /// Bytes received but not yet read.
    pending: BytesMut,
    /// Bytes we are still willing to receive.
    my_window: u32,
    /// Peer sent `Eof`, or we closed locally.
    eof: bool,
    /// Peer sent `Close`.
    remote_closed: bool,
}

struct WriteState {
    /// Bytes the peer currently allows us to send.
    remote_window: u32,
    /// Largest `Data` payload the peer accepts; set on open/confirm.
    max_remote_payload: u32,
    /// No further writes are possible (eof, close, or session teardown).
    closed: bool,
    sent_eof: bool,
    sent_close: bool,
}

impl Channel {
    pub(crate) fn new(
        session: Arc<SessionCore>,
        local_id: u32,
        direction: Direction,
        max_incoming_payload: u32,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(CHAN_SIZE);
        Self {
            inner: Arc::new(ChannelInner {
                session,
                local_id,
                direction,
                remote_id: AtomicU32::new(0),
                max_incoming_payload,
                read: Mutex::new(ReadState {
                    pending: BytesMut::new(),
                    my_window: CHANNEL_WINDOW_SIZE,
                    eof: false,
                    remote_closed: false,
                }),
                readable: Notify::new(),
                write: Mutex::new(WriteState {
                    remote_window: 0,
                    max_remote_payload: 0,
                    closed: false,
                    sent_eof: false,
                    sent_close: false,
                }),
                writable: Notify::new(),
                msg_tx: Mutex::new(Some(msg_tx)),
                msg_rx: Mutex::new(Some(msg_rx)),
            }),
        }
    }

    /// The id this side assigned to the channel.
    pub fn id(&self) -> u32 {
        self.inner.local_id
    }

    /// The id the peer assigned to the channel.
    pub fn remote_id(&self) -> u32 {
        self.inner.remote_id.load(Ordering::Acquire)
    }

    /// Which side initiated the channel.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end of stream; a read
    /// after the remote closed drains the pending buffer first.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Register for wakeups before checking state, so a notify
            // between the check and the await is not lost.
            let mut notified = std::pin::pin!(self.inner.readable.notified());
            notified.as_mut().enable();

            let serviced = {
                let mut rs = self.inner.read.lock();
                if !rs.pending.is_empty() {
                    let n = buf.len().min(rs.pending.len());
                    buf[..n].copy_from_slice(&rs.pending[..n]);
                    rs.pending.advance(n);
                    rs.my_window = rs.my_window.saturating_add(n as u32);
                    Some((n, rs.pending.is_empty() && rs.remote_closed))
                } else if rs.eof || rs.remote_closed {
                    return Ok(0);
                } else {
                    None
                }
            };

            match serviced {
                Some((n, drained)) => {
                    // Replenish the peer's view of our window. If the session
                    // is already down the bytes were still delivered locally.
                    if let Err(e) = self.adjust_window(n as u32).await {
                        tracing::debug!(channel_id = self.id(), error = %e, "window adjust dropped");
                    }
                    if drained {
                        self.inner.session.remove_channel(self.id());
                    }
                    return Ok(n);
                }
                None => notified.await,
            }
        }
    }

    /// Read exactly `buf.len()` bytes, erroring on early end of stream.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), MuxError> {
        let mut off = 0;
        while off < buf.len() {
            let n = self.read(&mut buf[off..]).await?;
            if n == 0 {
                return Err(MuxError::Closed);
            }
            off += n;
        }
        Ok(())
    }

    async fn adjust_window(&self, n: u32) -> Result<(), MuxError> {
        self.inner
            .session
            .send_msg(&Message::WindowAdjust {
                channel_id: self.remote_id(),
                additional_bytes: n,
            })
            .await
    }

    /// Write all of `data`, splitting it into packets no larger than the
    /// peer's maximum payload and suspending while the remote window is
    /// empty. Fails with [`MuxError::ChannelClosed`] after a local close.
    pub async fn write(&self, data: &[u8]) -> Result<usize, MuxError> {
        let total = data.len();
        let mut off = 0;
        while off < total {
            let take = self.reserve_window(total - off).await?;
            let payload = Bytes::copy_from_slice(&data[off..off + take]);
            self.inner
                .session
                .send_msg(&Message::Data {
                    channel_id: self.remote_id(),
                    payload,
                })
                .await?;
            off += take;
        }
        Ok(total)
    }

    /// Take up to `want` bytes from the remote window, waiting until at
    /// least one byte is available.
    async fn reserve_window(&self, want: usize) -> Result<usize, MuxError> {
        loop {
            let mut notified = std::pin::pin!(self.inner.writable.notified());
            notified.as_mut().enable();
            {
                let mut ws = self.inner.write.lock();
                if ws.closed {
                    return Err(MuxError::ChannelClosed);
                }
                if ws.remote_window > 0 {
                    let take = want
                        .min(ws.max_remote_payload as usize)
                        .min(ws.remote_window as usize);
                    ws.remote_window -= take as u32;
                    return Ok(take);
                }
            }
            notified.await;
        }
    }

    /// Half-close: signal the peer that no further data will be written.
    pub async fn close_write(&self) -> Result<(), MuxError> {
        {
            let mut ws = self.inner.write.lock();
            if ws.sent_eof || ws.sent_close {
                return Ok(());
            }
            ws.sent_eof = true;
            ws.closed = true;
        }
        self.inner.writable.notify_waiters();
        self.inner
            .session
            .send_msg(&Message::Eof {
                channel_id: self.remote_id(),
            })
            .await
    }

    /// Close the channel. Idempotent: the first call sends `Close` and
    /// removes the channel from the table; subsequent calls return without
    /// error.
    pub async fn close(&self) -> Result<(), MuxError> {
        {
            let mut ws = self.inner.write.lock();
            if ws.sent_close {
                return Ok(());
            }
            ws.sent_close = true;
            ws.closed = true;
        }
        {
            let mut rs = self.inner.read.lock();
            rs.eof = true;
        }
        self.inner.writable.notify_waiters();
        self.inner.readable.notify_waiters();

        let res = self
            .inner
            .session
            .send_msg(&Message::Close {
                channel_id: self.remote_id(),
            })
            .await;

        self.inner.session.remove_channel(self.id());

        // A close racing session teardown is not an error.
        match res {
            Err(MuxError::Closed) => Ok(()),
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Session-loop entry points.
    // ------------------------------------------------------------------

    /// Dispatch a frame addressed to this channel. Called only from the
    /// session's read loop, so per-channel frame order is transport order.
    pub(crate) fn handle(&self, msg: Message) -> Result<(), MuxError> {
        match msg {
            Message::Data { payload, .. } => self.handle_data(payload),
            Message::WindowAdjust {
                additional_bytes, ..
            } => {
                let mut ws = self.inner.write.lock();
                ws.remote_window = ws.remote_window.saturating_add(additional_bytes);
                drop(ws);
                self.inner.writable.notify_waiters();
                Ok(())
            }
            Message::Eof { .. } => {
                self.inner.read.lock().eof = true;
                self.inner.readable.notify_waiters();
                Ok(())
            }
            Message::Close { .. } => {
                self.handle_close();
                Ok(())
            }
            Message::OpenConfirm {
                sender_id,
                window_size,
                max_packet_size,
                ..
            } => {
                self.handle_open_confirm(sender_id, window_size, max_packet_size);
                Ok(())
            }
            Message::OpenFailure { .. } => {
                self.deliver_control(ControlMsg::Failed);
                Ok(())
            }
            Message::Open { .. } => Err(MuxError::Protocol(
                "open message routed to an existing channel".into(),
            )),
        }
    }

    fn handle_data(&self, payload: Bytes) -> Result<(), MuxError> {
        let len = payload.len() as u32;
        if len > self.inner.max_incoming_payload {
            return Err(MuxError::Protocol(format!(
                "remote wrote {len} bytes, exceeding the maximum packet size"
            )));
        }
        let mut rs = self.inner.read.lock();
        if len > rs.my_window {
            return Err(MuxError::Protocol(
                "remote side wrote too much".into(),
            ));
        }
        rs.my_window -= len;
        rs.pending.extend_from_slice(&payload);
        drop(rs);
        self.inner.readable.notify_waiters();
        Ok(())
    }

    /// The peer closed its side: unblock readers and writers, and drop the
    /// table entry once no undelivered bytes remain in the pending buffer.
    fn handle_close(&self) {
        {
            let mut ws = self.inner.write.lock();
            ws.closed = true;
        }
        let drained = {
            let mut rs = self.inner.read.lock();
            rs.remote_closed = true;
            rs.pending.is_empty()
        };
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
        // An open still waiting on the rendezvous sees a shut inbox.
        self.inner.msg_tx.lock().take();

        if drained {
            self.inner.session.remove_channel(self.id());
        }
    }

    fn handle_open_confirm(&self, sender_id: u32, window_size: u32, max_packet_size: u32) {
        self.set_remote(sender_id, window_size, max_packet_size);
        self.deliver_control(ControlMsg::Confirmed);
    }

    /// Record the peer's id and sending limits. Called before the channel is
    /// handed to `accept` (inbound) or the open rendezvous fires (outbound).
    /// The payload cap is clamped to `[1, CHANNEL_MAX_PACKET]` so a bogus
    /// advertisement cannot stall writers.
    pub(crate) fn set_remote(&self, remote_id: u32, window_size: u32, max_packet_size: u32) {
        self.inner.remote_id.store(remote_id, Ordering::Release);
        let mut ws = self.inner.write.lock();
        ws.remote_window = ws.remote_window.saturating_add(window_size);
        ws.max_remote_payload = max_packet_size.clamp(1, CHANNEL_MAX_PACKET);
        drop(ws);
        self.inner.writable.notify_waiters();
    }

    fn deliver_control(&self, msg: ControlMsg) {
        let tx = self.inner.msg_tx.lock().clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.try_send(msg) {
                tracing::debug!(channel_id = self.id(), dropped = ?e, "control message not delivered");
            }
        }
    }

    /// Take the receive side of the control inbox; consumed once by the
    /// session's `open`.
    pub(crate) fn take_open_rendezvous(&self) -> Option<mpsc::Receiver<ControlMsg>> {
        self.inner.msg_rx.lock().take()
    }

    /// Tear the channel down without touching the wire. Used when the
    /// session shuts down so blocked readers and writers unblock.
    pub(crate) fn shutdown(&self) {
        {
            let mut rs = self.inner.read.lock();
            rs.remote_closed = true;
        }
        {
            let mut ws = self.inner.write.lock();
            ws.closed = true;
        }
        self.inner.msg_tx.lock().take();
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
    }
}
