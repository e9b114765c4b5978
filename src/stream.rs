use crate::config::Config;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, PollSender, WaitForCancellationFutureOwned};
use tracing::trace;

/// Why a stream was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this side (`close()`, `shutdown()` or drop)
    Local,
    /// Closed by the peer
    Remote,
    /// The physical link carrying the stream went away
    Link,
}

/// State shared between a [`Stream`] and the link that carries it.
pub(crate) struct StreamShared {
    id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl StreamShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Close the stream. Only the first reason sticks; returns whether this
    /// call was the one that closed it.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.closed.cancel();
        if first {
            trace!("Stream {} closed ({:?})", self.id, reason);
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }
}

/// The link's handle on a stream: the shared state plus the producer end of
/// its incoming queue. Dropping the entry ends the incoming queue.
#[derive(Clone)]
pub(crate) struct StreamEntry {
    shared: Arc<StreamShared>,
    incoming: mpsc::UnboundedSender<Bytes>,
}

impl StreamEntry {
    /// Hand bytes received from the peer to the stream's reader.
    pub(crate) fn deliver(&self, payload: Bytes) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.incoming
            .send(payload)
            .map_err(|_| Error::StreamClosed)
    }

    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        self.shared.close(reason)
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }
}

/// A virtual stream carried over a shared physical link.
///
/// Implements `AsyncRead + AsyncWrite`. Reads return 0 once the stream is
/// closed and everything the peer sent before the close has been consumed
/// (a local close discards unread data). Writes fail with `BrokenPipe` once
/// the stream is closed, and block while the outgoing queue is full.
///
/// Read and write deadlines are enforced: a blocked operation whose deadline
/// passes fails with `TimedOut`.
pub struct Stream {
    shared: Arc<StreamShared>,

    /// Chunks received from the peer
    incoming: mpsc::UnboundedReceiver<Bytes>,

    /// Remainder of a partially read chunk
    pending: Bytes,

    /// Chunks waiting for the link's drain task (bounded)
    outgoing: PollSender<Bytes>,

    /// Largest chunk a single write queues
    chunk_size: usize,

    /// Wakes a blocked reader on local close
    read_closed: Pin<Box<WaitForCancellationFutureOwned>>,

    /// Wakes a blocked writer on close
    write_closed: Pin<Box<WaitForCancellationFutureOwned>>,

    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl Stream {
    /// Create a stream together with the link-side entry and the consumer end
    /// of its outgoing queue.
    pub(crate) fn new(
        id: u64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: &Config,
    ) -> (Stream, StreamEntry, mpsc::Receiver<Bytes>) {
        let shared = Arc::new(StreamShared {
            id,
            local_addr,
            peer_addr,
            closed: CancellationToken::new(),
            reason: OnceLock::new(),
        });

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.write_queue_depth);

        let now = Instant::now();
        let stream = Stream {
            read_closed: Box::pin(shared.closed.clone().cancelled_owned()),
            write_closed: Box::pin(shared.closed.clone().cancelled_owned()),
            shared: shared.clone(),
            incoming: incoming_rx,
            pending: Bytes::new(),
            outgoing: PollSender::new(outgoing_tx),
            chunk_size: config.transfer_chunk_size,
            read_timer: config.read_timeout.map(|d| Box::pin(tokio::time::sleep_until(now + d))),
            write_timer: config.write_timeout.map(|d| Box::pin(tokio::time::sleep_until(now + d))),
        };

        let entry = StreamEntry {
            shared,
            incoming: incoming_tx,
        };

        (stream, entry, outgoing_rx)
    }

    /// Get stream ID
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Local address of the physical link carrying this stream
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Remote address of the physical link carrying this stream
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the stream was closed, `None` while it is open
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Close the stream. Idempotent.
    ///
    /// Data already written is still sent to the peer, followed by a close
    /// notification. Unread incoming data is discarded.
    pub fn close(&self) {
        self.shared.close(CloseReason::Local);
    }

    /// Set the deadline for pending and future reads. `None` disables it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_timer = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Set the deadline for pending and future writes. `None` disables it.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_timer = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Set both the read and write deadlines.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_timer.as_ref().map(|t| t.deadline())
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_timer.as_ref().map(|t| t.deadline())
    }
}

fn closed_error() -> io::Error {
    Error::StreamClosed.into()
}

fn deadline_error(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline exceeded", op))
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.shared.close_reason() == Some(CloseReason::Local) {
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match this.incoming.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                // The link dropped its entry: remote close or link teardown
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => break,
            }
        }

        // A local close leaves the incoming queue open until the link retires
        // the stream, so the close signal has to wake us too. The close future
        // is never polled again once it has completed.
        if this.shared.is_closed() || this.read_closed.as_mut().poll(cx).is_ready() {
            if this.shared.close_reason() == Some(CloseReason::Local) {
                return Poll::Ready(Ok(()));
            }
        }

        if let Some(timer) = this.read_timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(deadline_error("read")));
            }
        }

        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.shared.is_closed() {
            return Poll::Ready(Err(closed_error()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.outgoing.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(this.chunk_size);
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                match this.outgoing.send_item(chunk) {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(_) => Poll::Ready(Err(closed_error())),
                }
            }
            // Drain task is gone
            Poll::Ready(Err(_)) => Poll::Ready(Err(closed_error())),
            Poll::Pending => {
                // Outgoing queue full: wait for the drain task, a close or the deadline
                if this.write_closed.as_mut().poll(cx).is_ready() {
                    this.outgoing.abort_send();
                    return Poll::Ready(Err(closed_error()));
                }
                if let Some(timer) = this.write_timer.as_mut() {
                    if timer.as_mut().poll(cx).is_ready() {
                        this.outgoing.abort_send();
                        return Poll::Ready(Err(deadline_error("write")));
                    }
                }
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Queued chunks belong to the drain task; nothing to flush here
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.close(CloseReason::Local);
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("close_reason", &self.shared.close_reason())
            .finish()
    }
}
