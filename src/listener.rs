use crate::config::Config;
use crate::error::{Error, Result};
use crate::link::{Link, Role};
use crate::stream::Stream;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// First delay after a transient accept error
const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Cap for the accept error backoff
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

type LinkTable = Arc<RwLock<HashMap<SocketAddr, Arc<Link>>>>;

/// Listener accepts physical links and hands out the virtual streams peers
/// open over them.
pub struct Listener {
    local_addr: SocketAddr,

    /// Streams opened by peers, fed by every link's demux loop
    accepted: Mutex<mpsc::Receiver<Stream>>,

    /// Live accepted links (peer address -> Link)
    links: LinkTable,

    /// Parent of `stopped` and of every link's token
    cancel: CancellationToken,

    /// Cancelled once the accept loop has ended
    stopped: CancellationToken,
}

impl Listener {
    /// Bind to `address` and start accepting links
    pub async fn bind<A: ToSocketAddrs>(address: A, config: Config) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;

        let config = Arc::new(config);
        let (accepted_tx, accepted_rx) = mpsc::channel(config.accept_backlog);
        let links: LinkTable = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let stopped = cancel.child_token();

        tokio::spawn(accept_loop(
            listener,
            config,
            accepted_tx,
            links.clone(),
            cancel.clone(),
            stopped.clone(),
        ));

        debug!("Listening on {}", local_addr);

        Ok(Self {
            local_addr,
            accepted: Mutex::new(accepted_rx),
            links,
            cancel,
            stopped,
        })
    }

    /// Like [`Listener::bind`], for callers that carry a network name.
    /// Only "tcp" is supported.
    pub async fn listen(network: &str, address: &str, config: Config) -> Result<Self> {
        if network != "tcp" {
            return Err(Error::UnsupportedNetwork(network.to_string()));
        }
        Self::bind(address, config).await
    }

    /// Wait for the next stream opened by a peer.
    ///
    /// Returns [`Error::ListenerClosed`] once the listener has stopped and
    /// every queued stream has been taken.
    pub async fn accept(&self) -> Result<Stream> {
        let mut accepted = self.accepted.lock().await;

        tokio::select! {
            biased;
            stream = accepted.recv() => stream.ok_or(Error::ListenerClosed),
            _ = self.stopped.cancelled() => {
                accepted.try_recv().map_err(|_| Error::ListenerClosed)
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the number of live accepted links
    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    /// Stop accepting and shut every accepted link down
    pub async fn close(&self) {
        self.cancel.cancel();

        let links: Vec<Arc<Link>> = {
            let mut links = self.links.write().await;
            links.drain().map(|(_, link)| link).collect()
        };
        for link in &links {
            link.close_all().await;
        }

        debug!("Listener on {} closed", self.local_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    accepted: mpsc::Sender<Stream>,
    links: LinkTable,
    cancel: CancellationToken,
    stopped: CancellationToken,
) {
    let mut backoff = Duration::ZERO;

    loop {
        let result = tokio::select! {
            _ = stopped.cancelled() => break,
            result = listener.accept() => result,
        };

        match result {
            Ok((socket, peer_addr)) => {
                backoff = Duration::ZERO;
                if let Err(e) = start_link(socket, peer_addr, &config, &accepted, &links, &cancel).await {
                    warn!("Failed to set up link from {}: {}", peer_addr, e);
                }
            }
            Err(e) if is_transient(&e) => {
                backoff = next_backoff(backoff);
                warn!("Accept error: {}; retrying in {:?}", e, backoff);
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => {
                error!("Accept on {:?} failed: {}", listener.local_addr().ok(), e);
                break;
            }
        }
    }

    stopped.cancel();
    debug!("Accept loop stopped");
}

async fn start_link(
    socket: TcpStream,
    peer_addr: SocketAddr,
    config: &Arc<Config>,
    accepted: &mpsc::Sender<Stream>,
    links: &LinkTable,
    cancel: &CancellationToken,
) -> Result<()> {
    let local_addr = socket.local_addr()?;
    socket.set_nodelay(true)?;

    let (link, outgoing) = Link::new(
        Role::Acceptor,
        local_addr,
        peer_addr,
        config.clone(),
        Some(accepted.clone()),
        cancel.child_token(),
    );

    links.write().await.insert(peer_addr, link.clone());
    debug!("Accepted link from {}", peer_addr);

    tokio::spawn(link.clone().watch_idle());

    let links = links.clone();
    tokio::spawn(async move {
        let _ = link.clone().run(socket, outgoing).await;

        let mut links = links.write().await;
        if links.get(&peer_addr).is_some_and(|l| Arc::ptr_eq(l, &link)) {
            links.remove(&peer_addr);
        }
        trace!("Link from {} removed", peer_addr);
    });

    Ok(())
}

/// Accept errors worth retrying: the failure belongs to one connection
/// attempt or is resource exhaustion that may clear up.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) || is_fd_exhaustion(e)
}

/// ENFILE / EMFILE
#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        MIN_ACCEPT_BACKOFF
    } else {
        (current * 2).min(MAX_ACCEPT_BACKOFF)
    }
}
