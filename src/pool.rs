use crate::config::Config;
use crate::error::{Error, Result};
use crate::link::{Link, Role};
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Dial bookkeeping for one address
#[derive(Debug, Default)]
struct PeerState {
    /// When the last dial attempt started
    last_attempt: Option<Instant>,

    /// A dial is scheduled or in flight
    dialing: bool,

    /// A link to this address has been up; redial it when it drops
    reconnect: bool,

    /// The last dial attempt ran into `dial_timeout`
    timed_out: bool,
}

struct PoolInner {
    config: Arc<Config>,

    /// Live links (address -> Link), at most one per address
    links: RwLock<HashMap<String, Arc<Link>>>,

    /// Dial state per address
    peers: Mutex<HashMap<String, PeerState>>,

    /// Addresses waiting for the reconnect worker
    pending: mpsc::Sender<String>,

    /// Cancellation token for pool shutdown, parent of every link's token
    cancel: CancellationToken,
}

/// Pool keeps one persistent TCP link per remote address and opens virtual
/// streams over it.
///
/// Links are established in the background: [`Pool::connect`] fails with a
/// retryable [`Error::NotConnected`] until the link is up, and a dropped
/// link is redialed automatically.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool and start its reconnect worker
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let (pending, pending_rx) = mpsc::channel(config.connect_queue_depth);

        let inner = Arc::new(PoolInner {
            config,
            links: RwLock::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            pending,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(reconnect_worker(inner.clone(), pending_rx));

        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a stream to `address` on its live link.
    ///
    /// Without a live link the address is queued for dialing and
    /// [`Error::NotConnected`] is returned; retry after a short delay.
    pub async fn connect(&self, address: &str) -> Result<Stream> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        if let Some(link) = self.link(address).await {
            if link.is_alive() {
                match link.open_stream().await {
                    Ok(stream) => {
                        trace!("Opened stream {} to {}", stream.id(), address);
                        return Ok(stream);
                    }
                    // Lost a race with link teardown; the link task re-queues the address
                    Err(Error::ConnectionClosed) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.inner.request_dial(address);
        Err(Error::NotConnected(address.to_string()))
    }

    /// Open a stream to `address`, retrying while the link comes up.
    ///
    /// Only the "tcp" network is supported. Makes `connect_attempts` tries,
    /// `connect_retry_delay` apart; there is no delay after the last one.
    /// Gives up with [`Error::Timeout`] when the background dial for the
    /// address last timed out, [`Error::NotConnected`] otherwise.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Stream> {
        if network != "tcp" {
            return Err(Error::UnsupportedNetwork(network.to_string()));
        }

        let attempts = self.inner.config.connect_attempts;
        let mut attempt = 1;
        loop {
            match self.connect(address).await {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    trace!("Dial {} attempt {}/{}: {}", address, attempt, attempts, e);
                    tokio::time::sleep(self.inner.config.connect_retry_delay).await;
                    attempt += 1;
                }
                Err(Error::NotConnected(address)) => {
                    if self.inner.dial_timed_out(&address).await {
                        return Err(Error::Timeout);
                    }
                    return Err(Error::NotConnected(address));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The live link to `address`, if any
    pub async fn link(&self, address: &str) -> Option<Arc<Link>> {
        self.inner.links.read().await.get(address).cloned()
    }

    pub async fn is_connected(&self, address: &str) -> bool {
        self.inner.is_connected(address).await
    }

    /// Get the number of live links
    pub async fn link_count(&self) -> usize {
        self.inner.links.read().await.len()
    }

    /// Forget `address` and shut its link down. Streams on it are closed and
    /// no reconnect is attempted until the next `connect`.
    pub async fn disconnect(&self, address: &str) {
        self.inner.peers.lock().await.remove(address);
        let link = self.inner.links.write().await.remove(address);
        if let Some(link) = link {
            link.shutdown();
            link.close_all().await;
            debug!("Disconnected from {}", address);
        }
    }

    /// Stop the reconnect worker and shut every link down
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let links: Vec<Arc<Link>> = {
            let mut links = self.inner.links.write().await;
            links.drain().map(|(_, link)| link).collect()
        };
        for link in &links {
            link.shutdown();
            link.close_all().await;
        }
        self.inner.peers.lock().await.clear();

        debug!("Pool shut down ({} links closed)", links.len());
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl PoolInner {
    async fn is_connected(&self, address: &str) -> bool {
        self.links
            .read()
            .await
            .get(address)
            .is_some_and(|link| link.is_alive())
    }

    async fn dial_timed_out(&self, address: &str) -> bool {
        self.peers
            .lock()
            .await
            .get(address)
            .is_some_and(|peer| peer.timed_out)
    }

    /// Queue `address` for the reconnect worker. Never blocks.
    fn request_dial(&self, address: &str) {
        match self.pending.try_send(address.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Connect queue full, dropping request for {}", address);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Schedule a dial unless the address is linked or already being dialed.
    /// Attempts to one address are spaced at least `reconnect_interval` apart.
    async fn schedule(self: &Arc<Self>, address: String) {
        if self.is_connected(&address).await {
            trace!("{} already linked", address);
            return;
        }

        let delay = {
            let mut peers = self.peers.lock().await;
            let peer = peers.entry(address.clone()).or_default();
            if peer.dialing {
                trace!("Dial to {} already pending", address);
                return;
            }
            peer.dialing = true;
            peer.last_attempt
                .map(|at| (at + self.config.reconnect_interval).saturating_duration_since(Instant::now()))
                .unwrap_or_default()
        };

        let inner = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                trace!("Dial to {} in {:?}", address, delay);
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            inner.dial(address).await;
        });
    }

    async fn dial(self: Arc<Self>, address: String) {
        // Linked since the dial was scheduled
        if self.is_connected(&address).await {
            if let Some(peer) = self.peers.lock().await.get_mut(&address) {
                peer.dialing = false;
            }
            trace!("{} already linked, dial skipped", address);
            return;
        }

        if let Some(peer) = self.peers.lock().await.get_mut(&address) {
            peer.last_attempt = Some(Instant::now());
            peer.timed_out = false;
        }

        debug!("Dialing {}", address);
        let socket = match tokio::time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(address.as_str()),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                warn!("Dial to {} failed: {}", address, e);
                return self.dial_failed(&address, false).await;
            }
            Err(_) => {
                warn!("Dial to {} timed out after {:?}", address, self.config.dial_timeout);
                return self.dial_failed(&address, true).await;
            }
        };

        if let Err(e) = self.start_link(address.clone(), socket).await {
            warn!("Failed to set up link to {}: {}", address, e);
            self.dial_failed(&address, false).await;
        }
    }

    async fn dial_failed(&self, address: &str, timed_out: bool) {
        let retry = match self.peers.lock().await.get_mut(address) {
            Some(peer) => {
                peer.dialing = false;
                peer.timed_out = timed_out;
                peer.reconnect
            }
            None => false,
        };

        // Addresses that were live before keep being retried
        if retry && !self.cancel.is_cancelled() {
            self.request_dial(address);
        }
    }

    async fn start_link(self: &Arc<Self>, address: String, socket: TcpStream) -> Result<()> {
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr()?;
        socket.set_nodelay(true)?;

        let (link, outgoing) = Link::new(
            Role::Dialer,
            local_addr,
            peer_addr,
            self.config.clone(),
            None,
            self.cancel.child_token(),
        );

        {
            let mut links = self.links.write().await;
            if links.get(&address).is_some_and(|l| l.is_alive()) {
                drop(links);
                // At most one live link per address: keep the one in the table
                debug!("Link to {} already up, dropping duplicate", address);
                link.shutdown();
                if let Some(peer) = self.peers.lock().await.get_mut(&address) {
                    peer.dialing = false;
                }
                return Ok(());
            }
            links.insert(address.clone(), link.clone());
        }

        let wanted = match self.peers.lock().await.get_mut(&address) {
            Some(peer) => {
                peer.dialing = false;
                peer.reconnect = true;
                true
            }
            None => false,
        };
        if !wanted {
            // Disconnected while the dial was in flight
            self.remove_link(&address, &link).await;
            return Ok(());
        }

        debug!("Link to {} established ({})", address, peer_addr);

        tokio::spawn(link.clone().keepalive());

        let inner = self.clone();
        tokio::spawn(async move {
            let _ = link.clone().run(socket, outgoing).await;
            inner.link_down(&address, &link).await;
        });

        Ok(())
    }

    /// Remove `link` from the table if it is still the entry for `address`
    async fn remove_link(&self, address: &str, link: &Arc<Link>) {
        let mut links = self.links.write().await;
        if links.get(address).is_some_and(|l| Arc::ptr_eq(l, link)) {
            links.remove(address);
        }
        link.shutdown();
    }

    async fn link_down(&self, address: &str, link: &Arc<Link>) {
        self.remove_link(address, link).await;

        let reconnect = self
            .peers
            .lock()
            .await
            .get(address)
            .is_some_and(|peer| peer.reconnect);

        if reconnect && !self.cancel.is_cancelled() {
            debug!("Link to {} dropped, reconnecting", address);
            self.request_dial(address);
        }
    }
}

/// Reconnect worker: turn queued addresses into dial tasks
async fn reconnect_worker(inner: Arc<PoolInner>, mut pending: mpsc::Receiver<String>) {
    loop {
        let address = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            address = pending.recv() => match address {
                Some(address) => address,
                None => break,
            },
        };
        inner.schedule(address).await;
    }
    debug!("Reconnect worker stopped");
}
