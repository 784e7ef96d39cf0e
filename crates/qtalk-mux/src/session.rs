//! Channel-multiplexing sessions.
//!
//! A session owns one transport and runs a single read loop that decodes
//! frames and dispatches them to the channel table. Only the read loop
//! receives from the transport; everything else rendezvouses with it through
//! per-channel inboxes. Writes from all channels are serialized behind one
//! async mutex.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ControlMsg, Direction};
use crate::error::MuxError;
use crate::frame::{
    Decoder, Encoder, Message, CHANNEL_MAX_PACKET, CHANNEL_WINDOW_SIZE, MAX_PACKET_LENGTH,
    MIN_PACKET_LENGTH,
};

/// How long an inbound channel may sit unaccepted before it is rejected
/// with `OpenFailure`.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffering on the session inbox and per-channel control inboxes. Small on
/// purpose: less buffering uncovers deadlocks more quickly.
pub(crate) const CHAN_SIZE: usize = 16;

/// How many recently removed channel ids to remember. Late frames for these
/// are dropped instead of killing the session; eviction is FIFO.
const MAX_TOMBSTONES: usize = 8192;

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional channel-muxing session over a reliable ordered
/// bytestream.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

pub(crate) struct SessionCore {
    writer: tokio::sync::Mutex<Encoder<BoxWrite>>,
    chans: Mutex<ChanList>,
    inbox_tx: mpsc::Sender<Channel>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
    closed: CancellationToken,
    err: Mutex<Option<MuxError>>,
    err_notify: Notify,
    accept_timeout: Duration,
}

impl Session {
    /// Run a session over the given transport. The read loop is spawned
    /// immediately; use [`Session::wait`] to observe shutdown.
    pub fn new<S>(transport: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_accept_timeout(transport, DEFAULT_ACCEPT_TIMEOUT)
    }

    /// Like [`Session::new`] with a custom inbound-accept timeout.
    pub fn with_accept_timeout<S>(transport: S, accept_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(transport);
        let (inbox_tx, inbox_rx) = mpsc::channel(CHAN_SIZE);
        let core = Arc::new(SessionCore {
            writer: tokio::sync::Mutex::new(Encoder::new(Box::new(w) as BoxWrite)),
            chans: Mutex::new(ChanList::default()),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            closed: CancellationToken::new(),
            err: Mutex::new(None),
            err_notify: Notify::new(),
            accept_timeout,
        });
        let decoder = Decoder::new(Box::new(r) as BoxRead);
        tokio::spawn(run(core.clone(), decoder));
        Session { core }
    }

    /// Establish a new channel with the other end.
    pub async fn open(&self) -> Result<Channel, MuxError> {
        if self.core.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        let ch = self.core.new_channel(Direction::Outbound);
        let mut rendezvous = ch
            .take_open_rendezvous()
            .expect("open rendezvous is consumed once per channel");

        if let Err(e) = self
            .core
            .send_msg(&Message::Open {
                sender_id: ch.id(),
                window_size: CHANNEL_WINDOW_SIZE,
                max_packet_size: CHANNEL_MAX_PACKET,
            })
            .await
        {
            self.core.remove_channel(ch.id());
            return Err(e);
        }

        match rendezvous.recv().await {
            Some(ControlMsg::Confirmed) => {
                tracing::debug!(channel_id = ch.id(), remote_id = ch.remote_id(), "channel open");
                Ok(ch)
            }
            Some(ControlMsg::Failed) => {
                self.core.remove_channel(ch.id());
                Err(MuxError::OpenFailed)
            }
            // Inbox shut: the session went down before the peer responded.
            None => Err(MuxError::Closed),
        }
    }

    /// Wait for and return the next channel opened by the peer.
    pub async fn accept(&self) -> Result<Channel, MuxError> {
        let mut inbox = self.core.inbox_rx.lock().await;
        tokio::select! {
            ch = inbox.recv() => ch.ok_or(MuxError::Closed),
            _ = self.core.closed.cancelled() => Err(MuxError::Closed),
        }
    }

    /// Shut the session down. The read loop tears down every channel,
    /// closes the transport, and publishes the terminating error.
    pub async fn close(&self) -> Result<(), MuxError> {
        self.core.closed.cancel();
        Ok(())
    }

    /// True once the session has begun shutting down.
    pub fn is_closed(&self) -> bool {
        self.core.closed.is_cancelled()
    }

    /// Block until the session has shut down and return the error that
    /// caused it ([`MuxError::Closed`] for a clean end of transport).
    pub async fn wait(&self) -> MuxError {
        loop {
            let mut notified = std::pin::pin!(self.core.err_notify.notified());
            notified.as_mut().enable();
            if let Some(err) = self.core.err.lock().clone() {
                return err;
            }
            notified.await;
        }
    }

    /// Number of live channels in the table (for diagnostics).
    pub fn num_channels(&self) -> usize {
        self.core.chans.lock().len()
    }
}

impl SessionCore {
    pub(crate) async fn send_msg(&self, msg: &Message) -> Result<(), MuxError> {
        if self.closed.is_cancelled() {
            return Err(MuxError::Closed);
        }
        let mut w = self.writer.lock().await;
        w.encode(msg).await
    }

    pub(crate) fn remove_channel(&self, id: u32) {
        self.chans.lock().remove(id);
    }

    fn new_channel(self: &Arc<Self>, direction: Direction) -> Channel {
        let mut chans = self.chans.lock();
        chans.add(|id| Channel::new(self.clone(), id, direction, CHANNEL_MAX_PACKET))
    }

    async fn dispatch(self: &Arc<Self>, msg: Message) -> Result<(), MuxError> {
        match msg {
            Message::Open {
                sender_id,
                window_size,
                max_packet_size,
            } => self.handle_open(sender_id, window_size, max_packet_size).await,
            other => {
                let id = other
                    .channel_id()
                    .ok_or_else(|| MuxError::Protocol("message without a channel id".into()))?;
                let ch = {
                    let chans = self.chans.lock();
                    match chans.get(id) {
                        Some(ch) => ch,
                        // A closed channel's slot is reclaimed as soon as we
                        // send Close, so the peer's own Close (and data
                        // already in flight) can land after removal.
                        None if chans.is_tombstoned(id) => {
                            tracing::trace!(channel_id = id, "dropping frame for closed channel");
                            return Ok(());
                        }
                        None => {
                            return Err(MuxError::Protocol(format!("invalid channel {id}")));
                        }
                    }
                };
                ch.handle(other)
            }
        }
    }

    /// Queue an inbound channel for `accept`, confirming only once it is
    /// consumed. Runs inline in the read loop, so an unaccepted channel
    /// stalls the session for at most the accept timeout.
    async fn handle_open(
        self: &Arc<Self>,
        sender_id: u32,
        window_size: u32,
        max_packet_size: u32,
    ) -> Result<(), MuxError> {
        let size = max_packet_size as usize;
        if size < MIN_PACKET_LENGTH || size >= MAX_PACKET_LENGTH {
            tracing::debug!(sender_id, max_packet_size, "rejecting open: max packet size out of range");
            return self
                .send_msg(&Message::OpenFailure {
                    channel_id: sender_id,
                })
                .await;
        }

        let ch = self.new_channel(Direction::Inbound);
        ch.set_remote(sender_id, window_size, max_packet_size);

        match tokio::time::timeout(self.accept_timeout, self.inbox_tx.send(ch.clone())).await {
            Ok(Ok(())) => {
                self.send_msg(&Message::OpenConfirm {
                    channel_id: sender_id,
                    sender_id: ch.id(),
                    window_size: CHANNEL_WINDOW_SIZE,
                    max_packet_size: CHANNEL_MAX_PACKET,
                })
                .await
            }
            _ => {
                tracing::debug!(channel_id = ch.id(), "inbound channel not accepted in time");
                self.remove_channel(ch.id());
                self.send_msg(&Message::OpenFailure {
                    channel_id: sender_id,
                })
                .await
            }
        }
    }

    async fn teardown(&self, err: MuxError) {
        let dropped = self.chans.lock().drop_all();
        for ch in &dropped {
            ch.shutdown();
        }
        {
            let mut w = self.writer.lock().await;
            if let Err(e) = w.shutdown().await {
                tracing::debug!(error = %e, "transport shutdown failed");
            }
        }
        self.closed.cancel();
        *self.err.lock() = Some(err);
        self.err_notify.notify_waiters();
    }
}

/// The connection machine: process packets until an error, then tear down.
/// Synchronize on exit with [`Session::wait`].
async fn run(core: Arc<SessionCore>, mut decoder: Decoder<BoxRead>) {
    let err = loop {
        tokio::select! {
            _ = core.closed.cancelled() => break MuxError::Closed,
            res = decoder.decode() => match res {
                Ok(msg) => {
                    if let Err(e) = core.dispatch(msg).await {
                        break e;
                    }
                }
                Err(e) => break e,
            },
        }
    };
    if !matches!(err, MuxError::Closed) {
        tracing::debug!(error = %err, "session loop terminated");
    }
    core.teardown(err).await;
}

/// The channel table. Ids are assigned lowest-free-slot first; removed ids
/// are tombstoned so late frames for them can be told apart from frames for
/// channels that never existed.
#[derive(Default)]
struct ChanList {
    chans: Vec<Option<Channel>>,
    tombstone_order: VecDeque<u32>,
    tombstoned: HashSet<u32>,
}

impl ChanList {
    fn add(&mut self, build: impl FnOnce(u32) -> Channel) -> Channel {
        let idx = match self.chans.iter().position(Option::is_none) {
            Some(idx) => idx,
            None => {
                self.chans.push(None);
                self.chans.len() - 1
            }
        };
        let ch = build(idx as u32);
        self.chans[idx] = Some(ch.clone());
        ch
    }

    fn get(&self, id: u32) -> Option<Channel> {
        self.chans.get(id as usize).and_then(Clone::clone)
    }

    fn remove(&mut self, id: u32) {
        let Some(slot) = self.chans.get_mut(id as usize) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        if self.tombstoned.insert(id) {
            self.tombstone_order.push_back(id);
            while self.tombstone_order.len() > MAX_TOMBSTONES {
                if let Some(evicted) = self.tombstone_order.pop_front() {
                    self.tombstoned.remove(&evicted);
                }
            }
        }
    }

    /// A live channel's slot wins over a stale tombstone for a reused id;
    /// callers check the table first.
    fn is_tombstoned(&self, id: u32) -> bool {
        self.tombstoned.contains(&id)
    }

    fn drop_all(&mut self) -> Vec<Channel> {
        self.chans.drain(..).flatten().collect()
    }

    fn len(&self) -> usize {
        self.chans.iter().flatten().count()
    }
}
