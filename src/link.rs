use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{Flag, Packet, PacketCodec, LINK_STREAM_ID};
use crate::stream::{CloseReason, Stream, StreamEntry, StreamShared};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which end of the physical link we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the link, opens streams, sends pings
    Dialer,
    /// Accepted the link, accepts streams, watches for idleness
    Acceptor,
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<u64, StreamEntry>,

    /// Acceptor only: IDs closed locally whose close the peer has not echoed
    /// yet. Late data for them is dropped instead of opening a new stream.
    retired: HashSet<u64>,
}

/// Link is one physical TCP connection carrying many virtual streams
///
/// Owns the stream table and demultiplexes incoming packets to streams. A
/// writer task serializes every outgoing packet onto the socket.
pub struct Link {
    role: Role,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    config: Arc<Config>,

    /// Active streams and retired IDs
    table: RwLock<StreamTable>,

    /// Next stream ID handed out by `open_stream` (dialer only)
    next_stream_id: AtomicU64,

    /// When the link was created, reference point for `last_ping`
    created: Instant,

    /// Milliseconds after `created` at which the last ping arrived
    last_ping: AtomicU64,

    /// Channel to the writer task
    outgoing: mpsc::Sender<Packet>,

    /// Queue of streams opened by the peer (acceptor only)
    accepted: Option<mpsc::Sender<Stream>>,

    /// Cancellation token for link teardown
    cancel: CancellationToken,
}

impl Link {
    /// Create a link. The returned receiver feeds the writer task started by
    /// [`Link::run`].
    pub(crate) fn new(
        role: Role,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: Arc<Config>,
        accepted: Option<mpsc::Sender<Stream>>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (outgoing, outgoing_rx) = mpsc::channel(config.link_queue_depth);

        let link = Arc::new(Self {
            role,
            local_addr,
            peer_addr,
            config,
            table: RwLock::new(StreamTable::default()),
            next_stream_id: AtomicU64::new(1),
            created: Instant::now(),
            last_ping: AtomicU64::new(0),
            outgoing,
            accepted,
            cancel,
        });

        (link, outgoing_rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the remote peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Check if link is alive
    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Tear the link down. Every stream on it is closed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Time since the last ping from the peer (or since creation)
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ping.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Get the number of active streams
    pub async fn stream_count(&self) -> usize {
        self.table.read().await.streams.len()
    }

    /// Whether a stream with this ID is in the table
    pub async fn contains(&self, id: u64) -> bool {
        self.table.read().await.streams.contains_key(&id)
    }

    /// Open a new stream to the peer with the next free ID
    pub async fn open_stream(self: &Arc<Self>) -> Result<Stream> {
        if self.role != Role::Dialer {
            return Err(Error::Protocol("Only the dialing side opens streams".into()));
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.create_stream(id).await
    }

    /// Register a stream under `id` and start its drain task
    pub(crate) async fn create_stream(self: &Arc<Self>, id: u64) -> Result<Stream> {
        let (stream, entry, outgoing) =
            Stream::new(id, self.local_addr, self.peer_addr, &self.config);

        {
            let mut table = self.table.write().await;
            // Checked under the lock so close_all cannot miss this stream
            if self.cancel.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }
            if table.streams.contains_key(&id) {
                return Err(Error::Protocol(format!("Stream {} already exists", id)));
            }
            table.streams.insert(id, entry.clone());
        }

        tokio::spawn(drain(self.clone(), entry.shared().clone(), outgoing));
        trace!("Created stream {} on link to {}", id, self.peer_addr);

        Ok(stream)
    }

    pub(crate) async fn lookup(&self, id: u64) -> Option<StreamEntry> {
        self.table.read().await.streams.get(&id).cloned()
    }

    /// Remove a stream and close it. Idempotent.
    pub(crate) async fn remove(&self, id: u64, reason: CloseReason) -> bool {
        let entry = self.table.write().await.streams.remove(&id);
        match entry {
            Some(entry) => {
                entry.close(reason);
                true
            }
            None => false,
        }
    }

    /// Remove a locally closed stream. The acceptor remembers the ID until
    /// the peer echoes the close.
    async fn retire(&self, id: u64) -> bool {
        let mut table = self.table.write().await;
        let removed = table.streams.remove(&id).is_some();
        if removed && self.role == Role::Acceptor {
            table.retired.insert(id);
        }
        removed
    }

    /// Close every stream on the link and empty the table
    pub(crate) async fn close_all(&self) {
        let entries: Vec<StreamEntry> = {
            let mut table = self.table.write().await;
            table.retired.clear();
            table.streams.drain().map(|(_, entry)| entry).collect()
        };

        for entry in &entries {
            entry.close(CloseReason::Link);
        }

        if !entries.is_empty() {
            debug!("Closed {} streams on link to {}", entries.len(), self.peer_addr);
        }
    }

    /// Queue a packet for the writer task
    pub(crate) async fn send(&self, packet: Packet) -> Result<()> {
        self.outgoing
            .send(packet)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_ping.store(now, Ordering::Relaxed);
    }

    /// Run the link over `io` until the peer goes away, a protocol error
    /// occurs or the link is shut down. All streams are closed on return.
    pub(crate) async fn run<S>(self: Arc<Self>, io: S, outgoing: mpsc::Receiver<Packet>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let codec = PacketCodec::new(self.config.max_payload_size);
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        debug!(
            "Link {} <-> {} up as {:?}",
            self.local_addr, self.peer_addr, self.role
        );

        let result = tokio::select! {
            result = self.demux(reader) => result,
            result = write_packets(writer, outgoing) => result,
            _ = self.cancel.cancelled() => Ok(()),
        };

        self.shutdown();
        self.close_all().await;

        match &result {
            Ok(()) => debug!("Link to {} closed", self.peer_addr),
            Err(e) => warn!("Link to {} failed: {}", self.peer_addr, e),
        }
        result
    }

    /// Route incoming packets to streams
    async fn demux<R>(self: &Arc<Self>, mut reader: FramedRead<R, PacketCodec>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(packet) = reader.next().await {
            let packet = packet?;
            match packet.flag {
                Flag::Ping => {
                    trace!("Ping from {}", self.peer_addr);
                    self.touch();
                }
                Flag::Close => self.handle_close(packet.stream_id).await,
                Flag::None => self.handle_data(packet.stream_id, packet.payload).await?,
            }
        }

        debug!("Peer {} closed the link", self.peer_addr);
        Ok(())
    }

    async fn handle_close(&self, id: u64) {
        if self.remove(id, CloseReason::Remote).await {
            // The stream's drain task echoes the close after its last packet
            debug!("Stream {} closed by peer {}", id, self.peer_addr);
        } else {
            // Echo of our own close, or a stream we never saw
            self.table.write().await.retired.remove(&id);
        }
    }

    async fn handle_data(self: &Arc<Self>, id: u64, payload: Bytes) -> Result<()> {
        if id == LINK_STREAM_ID {
            return Err(Error::Protocol("Data packet for stream 0".into()));
        }

        if let Some(entry) = self.lookup(id).await {
            if entry.deliver(payload).is_err() {
                // Closed locally, its drain task retires it
                trace!("Dropping data for closed stream {}", id);
            }
            return Ok(());
        }

        match self.role {
            Role::Dialer => {
                if id >= self.next_stream_id.load(Ordering::SeqCst) {
                    return Err(Error::Protocol(format!(
                        "Data for stream {} which was never opened",
                        id
                    )));
                }
                trace!("Dropping data for stale stream {}", id);
                Ok(())
            }
            Role::Acceptor => {
                if self.table.read().await.retired.contains(&id) {
                    trace!("Dropping data for retired stream {}", id);
                    return Ok(());
                }

                let stream = self.create_stream(id).await?;
                if let Some(entry) = self.lookup(id).await {
                    let _ = entry.deliver(payload);
                }
                debug!("Accepted stream {} from {}", id, self.peer_addr);
                self.publish(stream);
                Ok(())
            }
        }
    }

    /// Hand a peer-opened stream to the accept queue without blocking demux
    fn publish(&self, stream: Stream) {
        let Some(accepted) = &self.accepted else {
            return;
        };

        match accepted.try_send(stream) {
            Ok(()) => {}
            Err(TrySendError::Full(stream)) => {
                let accepted = accepted.clone();
                tokio::spawn(async move {
                    let _ = accepted.send(stream).await;
                });
            }
            Err(TrySendError::Closed(stream)) => {
                debug!("Accept queue gone, closing stream {}", stream.id());
            }
        }
    }

    /// Ping the peer every keepalive interval. Shuts the link down if a ping
    /// can no longer be queued.
    pub(crate) async fn keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            trace!("Ping to {}", self.peer_addr);
            if self.send(Packet::ping()).await.is_err() {
                debug!("Keepalive to {} failed", self.peer_addr);
                self.shutdown();
                return;
            }
        }
    }

    /// Shut the link down once no ping has arrived for the idle timeout
    pub(crate) async fn watch_idle(self: Arc<Self>) {
        let period = self.config.idle_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let idle = self.idle_for();
            if idle > self.config.idle_timeout {
                warn!(
                    "Link to {} idle for {:?}, closing",
                    self.peer_addr, idle
                );
                self.shutdown();
                return;
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Writer task: serialize queued packets onto the socket
async fn write_packets<W>(
    mut sink: FramedWrite<W, PacketCodec>,
    mut outgoing: mpsc::Receiver<Packet>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = outgoing.recv().await {
        sink.feed(packet).await?;
        // Batch whatever else is queued into one flush
        while let Ok(packet) = outgoing.try_recv() {
            sink.feed(packet).await?;
        }
        sink.flush().await?;
    }
    Ok(())
}

/// Drain task: move a stream's queued writes onto the link in packets of at
/// most `transfer_chunk_size` bytes.
///
/// On a local close the queued data is flushed, then the peer is told. On a
/// remote close queued data is discarded and the close is echoed; being sent
/// from this task, the echo always follows the stream's last data packet.
async fn drain(link: Arc<Link>, stream: Arc<StreamShared>, mut outgoing: mpsc::Receiver<Bytes>) {
    let id = stream.id();
    let chunk_size = link.config.transfer_chunk_size;
    let mut carry = None;

    loop {
        let first = match carry.take() {
            Some(chunk) => chunk,
            None => tokio::select! {
                biased;
                chunk = outgoing.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
                _ = stream.closed_token().cancelled() => break,
            },
        };

        if stream.is_closed() && stream.close_reason() != Some(CloseReason::Local) {
            break;
        }

        let payload = coalesce(first, &mut outgoing, &mut carry, chunk_size);
        trace!("Stream {} -> {} bytes", id, payload.len());
        if link.send(Packet::data(id, payload)).await.is_err() {
            stream.close(CloseReason::Link);
            break;
        }
    }

    match stream.close_reason() {
        Some(CloseReason::Local) => {}
        Some(CloseReason::Remote) => {
            let _ = link.send(Packet::close(id)).await;
            return;
        }
        _ => return,
    }

    // Whatever was written before the close still goes out
    outgoing.close();
    loop {
        let first = match carry.take().or_else(|| outgoing.try_recv().ok()) {
            Some(chunk) => chunk,
            None => break,
        };
        let payload = coalesce(first, &mut outgoing, &mut carry, chunk_size);
        if link.send(Packet::data(id, payload)).await.is_err() {
            return;
        }
    }

    // Sent even if a close from the peer crossed ours, so a retiring
    // acceptor on the other side gets its echo
    if link.retire(id).await {
        debug!("Stream {} closed, notifying {}", id, link.peer_addr);
    }
    let _ = link.send(Packet::close(id)).await;
}

/// Merge queued chunks behind `first` up to `chunk_size`. A chunk that does
/// not fit is left in `carry` for the next packet.
fn coalesce(
    first: Bytes,
    outgoing: &mut mpsc::Receiver<Bytes>,
    carry: &mut Option<Bytes>,
    chunk_size: usize,
) -> Bytes {
    if first.len() >= chunk_size {
        return first;
    }

    let mut buf: Option<BytesMut> = None;
    let mut len = first.len();
    while len < chunk_size {
        match outgoing.try_recv() {
            Ok(next) if len + next.len() <= chunk_size => {
                let buf = buf.get_or_insert_with(|| {
                    let mut buf = BytesMut::with_capacity(chunk_size);
                    buf.extend_from_slice(&first);
                    buf
                });
                buf.extend_from_slice(&next);
                len = buf.len();
            }
            Ok(next) => {
                *carry = Some(next);
                break;
            }
            Err(_) => break,
        }
    }

    match buf {
        Some(buf) => buf.freeze(),
        None => first,
    }
}
