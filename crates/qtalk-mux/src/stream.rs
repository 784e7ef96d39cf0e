//! `AsyncRead`/`AsyncWrite` adapter for channels.
//!
//! Wraps the channel's inherent read/write API into a poll-based byte stream
//! so a channel kept open after an RPC response can be driven with the usual
//! `tokio::io` utilities.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::channel::Channel;
use crate::error::MuxError;

const READ_CHUNK: usize = 8192;

/// A bidirectional byte stream over a channel.
///
/// `poll_shutdown` half-closes the channel (sends `Eof`); dropping the
/// stream leaves the channel open, since the channel handle is shared.
pub struct ChannelStream {
    ch: Channel,

    buffered: Bytes,
    read_eof: bool,
    pending_recv: Option<BoxFuture<'static, Result<Vec<u8>, MuxError>>>,

    pending_write: Option<PendingWrite>,
    write_closed: bool,
}

struct PendingWrite {
    len: usize,
    done: bool,
    fut: BoxFuture<'static, Result<usize, MuxError>>,
}

impl ChannelStream {
    pub fn new(ch: Channel) -> Self {
        Self {
            ch,
            buffered: Bytes::new(),
            read_eof: false,
            pending_recv: None,
            pending_write: None,
            write_closed: false,
        }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.ch
    }

    /// Drive an in-flight write to completion without consuming it.
    fn drive_write(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Some(pending) = self.pending_write.as_mut() {
            if !pending.done {
                match pending.fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(_)) => pending.done = true,
                    Poll::Ready(Err(e)) => {
                        self.pending_write = None;
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            e,
                        )));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.buffered.is_empty() {
                let n = self.buffered.len().min(buf.remaining());
                buf.put_slice(&self.buffered.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if self.read_eof {
                return Poll::Ready(Ok(()));
            }

            if self.pending_recv.is_none() {
                let ch = self.ch.clone();
                self.pending_recv = Some(Box::pin(async move {
                    let mut chunk = vec![0u8; READ_CHUNK];
                    let n = ch.read(&mut chunk).await?;
                    chunk.truncate(n);
                    Ok(chunk)
                }));
            }

            let fut = self.pending_recv.as_mut().expect("recv future installed above");
            match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(chunk)) => {
                    self.pending_recv = None;
                    if chunk.is_empty() {
                        self.read_eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    self.buffered = Bytes::from(chunk);
                }
                Poll::Ready(Err(e)) => {
                    self.pending_recv = None;
                    return Poll::Ready(Err(std::io::Error::other(e)));
                }
            }
        }
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel write side closed",
            )));
        }

        match self.drive_write(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        if let Some(pending) = self.pending_write.take() {
            // The chunk accepted on an earlier (Pending) call is now on the
            // wire; report it consumed before accepting new data.
            return Poll::Ready(Ok(pending.len));
        }

        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let ch = self.ch.clone();
        let owned = data.to_vec();
        let len = owned.len();
        self.pending_write = Some(PendingWrite {
            len,
            done: false,
            fut: Box::pin(async move { ch.write(&owned).await }),
        });

        match self.drive_write(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                self.pending_write = None;
                Poll::Ready(Ok(len))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Channel writes land on the wire when their future completes; a
        // completed-but-unreported write stays queued for poll_write.
        self.drive_write(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        if !self.write_closed {
            self.write_closed = true;
            let ch = self.ch.clone();
            tokio::spawn(async move {
                if let Err(e) = ch.close_write().await {
                    tracing::debug!(error = %e, "channel half-close failed");
                }
            });
        }
        Poll::Ready(Ok(()))
    }
}
