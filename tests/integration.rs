// Integration tests over real loopback TCP links

use futures_util::{SinkExt, StreamExt};
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use vnet::{CloseReason, Config, Error, Listener, Packet, PacketCodec, Pool};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,vnet=debug")
        .try_init();
}

/// Listener on an ephemeral port that echoes every stream back
async fn echo_server(config: Config) -> (Arc<Listener>, String) {
    let listener = Arc::new(Listener::bind("127.0.0.1:0", config).await.unwrap());
    let address = listener.local_addr().to_string();

    let accept = listener.clone();
    tokio::spawn(async move {
        while let Ok(stream) = accept.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    (listener, address)
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timeout waiting for {}", what));
}

/// Write `data` in random fragments and read the echo back.
async fn echo_round_trip(stream: &mut vnet::Stream, data: &[u8]) {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + rng.gen_range(1..=300)).min(data.len());
        stream.write_all(&data[offset..end]).await.unwrap();
        offset = end;
    }

    let mut echoed = vec![0u8; data.len()];
    tokio::time::timeout(TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .expect("Timeout reading echo")
        .unwrap();
    assert!(
        echoed == data,
        "echo mismatch: sent {}.. got {}..",
        hex::encode(&data[..16.min(data.len())]),
        hex::encode(&echoed[..16.min(echoed.len())]),
    );
}

/// 2050 random bytes written in fragments come back intact.
#[tokio::test]
async fn test_echo_random_payload() {
    init_tracing();
    let (_listener, address) = echo_server(Config::default()).await;
    let pool = Pool::new(Config::default());

    let mut stream = pool.dial("tcp", &address).await.unwrap();

    let mut data = vec![0u8; 2050];
    rand::thread_rng().fill(&mut data[..]);
    echo_round_trip(&mut stream, &data).await;

    // Larger than one chunk, so it crosses packet boundaries
    let mut data = vec![0u8; 64 * 1024 + 7];
    rand::thread_rng().fill(&mut data[..]);
    echo_round_trip(&mut stream, &data).await;

    pool.shutdown().await;
}

/// The first connect only queues a dial; dial() retries until the link is up.
#[tokio::test]
async fn test_dial_retries_until_link_up() {
    init_tracing();
    let (_listener, address) = echo_server(Config::default()).await;
    let pool = Pool::new(Config::default());

    let err = pool.connect(&address).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(_)));
    assert!(err.is_retryable());

    let mut stream = pool.dial("tcp", &address).await.unwrap();
    echo_round_trip(&mut stream, b"after retry").await;
    assert!(pool.is_connected(&address).await);
}

/// dial() gives up with a retryable error when nothing listens.
#[tokio::test]
async fn test_dial_unreachable() {
    init_tracing();
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = socket.local_addr().unwrap().to_string();
    drop(socket);

    let pool = Pool::new(Config::default().with_connect_retry_delay(Duration::from_millis(50)));
    let start = tokio::time::Instant::now();
    let err = pool.dial("tcp", &address).await.unwrap_err();

    assert!(err.is_retryable());
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.link_count().await, 0);

    assert!(matches!(
        pool.dial("udp", &address).await,
        Err(Error::UnsupportedNetwork(_))
    ));
}

/// Concurrent connects to one address end up on a single physical link.
#[tokio::test]
async fn test_concurrent_connects_share_one_link() {
    init_tracing();
    let (listener, address) = echo_server(Config::default()).await;
    let pool = Arc::new(Pool::new(Config::default()));

    let mut handles = Vec::new();
    for i in 0..32 {
        let pool = pool.clone();
        let address = address.clone();
        handles.push(tokio::spawn(async move {
            let mut stream = loop {
                match pool.connect(&address).await {
                    Ok(stream) => break stream,
                    Err(e) if e.is_retryable() => {
                        tokio::time::sleep(Duration::from_millis(10)).await
                    }
                    Err(e) => panic!("connect {} failed: {}", i, e),
                }
            };
            let message = format!("client {}", i);
            echo_round_trip(&mut stream, message.as_bytes()).await;
            stream
        }));
    }

    let mut streams = Vec::new();
    for handle in handles {
        let stream = tokio::time::timeout(TIMEOUT, handle)
            .await
            .expect("Timeout connecting")
            .unwrap();
        streams.push(stream);
    }

    assert_eq!(pool.link_count().await, 1);
    assert_eq!(listener.link_count().await, 1);

    // All streams share the link and have distinct IDs
    let link = pool.link(&address).await.unwrap();
    assert_eq!(link.stream_count().await, 32);
    let mut ids: Vec<u64> = streams.iter().map(|s| s.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 32);
}

/// Interleaved traffic on concurrent streams never crosses over.
#[tokio::test]
async fn test_concurrent_streams_are_isolated() {
    init_tracing();
    let (_listener, address) = echo_server(Config::default()).await;
    let pool = Arc::new(Pool::new(Config::default()));
    drop(pool.dial("tcp", &address).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..10u8 {
        let pool = pool.clone();
        let address = address.clone();
        handles.push(tokio::spawn(async move {
            let mut stream = pool.connect(&address).await.unwrap();
            for round in 0..20u8 {
                let data = vec![i.wrapping_mul(31).wrapping_add(round); 1000 + i as usize];
                echo_round_trip(&mut stream, &data).await;
            }
        }));
    }

    for handle in handles {
        tokio::time::timeout(TIMEOUT, handle)
            .await
            .expect("Timeout on concurrent streams")
            .unwrap();
    }
}

/// Closing one side ends the other side's reads after the data sent before
/// the close, and its writes fail.
#[tokio::test]
async fn test_close_semantics() {
    init_tracing();
    let listener = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();
    let address = listener.local_addr().to_string();
    let pool = Pool::new(Config::default());

    // Client closes
    let mut client = pool.dial("tcp", &address).await.unwrap();
    client.write_all(b"last words").await.unwrap();
    client.shutdown().await.unwrap();
    assert_eq!(client.close_reason(), Some(CloseReason::Local));

    let mut server = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("Timeout accepting stream")
        .unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(TIMEOUT, server.read_to_end(&mut received))
        .await
        .expect("Timeout waiting for EOF")
        .unwrap();
    assert_eq!(received, b"last words");
    assert_eq!(server.close_reason(), Some(CloseReason::Remote));
    let err = server.write(b"too late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

    // Server closes
    let mut client = pool.connect(&address).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let server = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("Timeout accepting stream")
        .unwrap();
    server.close();

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .expect("Timeout waiting for EOF")
        .unwrap();
    assert_eq!(n, 0);
    let err = client.write(b"y").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

/// A writer racing the peer's close fails cleanly, late data does not
/// resurrect the stream and the link stays usable.
#[tokio::test]
async fn test_close_under_concurrent_write() {
    init_tracing();
    let listener = Listener::bind("127.0.0.1:0", Config::default()).await.unwrap();
    let address = listener.local_addr().to_string();
    let pool = Pool::new(Config::default());

    let mut client = pool.dial("tcp", &address).await.unwrap();
    let writer = tokio::spawn(async move {
        let chunk = vec![7u8; 512];
        loop {
            if let Err(e) = client.write_all(&chunk).await {
                return e.kind();
            }
            tokio::task::yield_now().await;
        }
    });

    let mut server = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("Timeout accepting stream")
        .unwrap();
    let mut buf = vec![0u8; 4096];
    server.read_exact(&mut buf).await.unwrap();
    drop(server);

    let kind = tokio::time::timeout(TIMEOUT, writer)
        .await
        .expect("Writer not stopped by remote close")
        .unwrap();
    assert_eq!(kind, std::io::ErrorKind::BrokenPipe);

    // Data that was in flight must not show up as a new stream
    assert!(tokio::time::timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());

    let mut stream = pool.connect(&address).await.unwrap();
    stream.write_all(b"still alive").await.unwrap();
    let mut server = tokio::time::timeout(TIMEOUT, listener.accept())
        .await
        .expect("Timeout accepting second stream")
        .unwrap();
    let mut buf = [0u8; 11];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still alive");
    assert_eq!(pool.link_count().await, 1);
}

/// Severing the physical link closes every stream on it and empties the table.
#[tokio::test]
async fn test_link_loss_closes_all_streams() {
    init_tracing();
    let (_listener, address) = echo_server(Config::default()).await;
    let pool = Pool::new(Config::default());

    let mut streams = vec![pool.dial("tcp", &address).await.unwrap()];
    for _ in 0..4 {
        streams.push(pool.connect(&address).await.unwrap());
    }
    for stream in streams.iter_mut() {
        echo_round_trip(stream, b"ping").await;
    }

    let link = pool.link(&address).await.unwrap();
    assert_eq!(link.stream_count().await, 5);
    link.shutdown();

    let mut buf = [0u8; 4];
    for stream in streams.iter_mut() {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
            .await
            .expect("Timeout waiting for EOF")
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(stream.close_reason(), Some(CloseReason::Link));
    }

    let check = link.clone();
    wait_until("empty stream table", || {
        let link = check.clone();
        async move { link.stream_count().await == 0 }
    })
    .await;
}

/// A dropped link is redialed in the background.
#[tokio::test]
async fn test_reconnect_after_link_loss() {
    init_tracing();
    let (_listener, address) = echo_server(Config::default()).await;
    let pool = Arc::new(Pool::new(
        Config::default().with_reconnect_interval(Duration::from_millis(100)),
    ));

    let mut stream = pool.dial("tcp", &address).await.unwrap();
    echo_round_trip(&mut stream, b"first").await;

    let old = pool.link(&address).await.unwrap();
    old.shutdown();

    let check = (pool.clone(), address.clone(), old.clone());
    wait_until("new link", || {
        let (pool, address, old) = check.clone();
        async move {
            match pool.link(&address).await {
                Some(link) => !Arc::ptr_eq(&link, &old) && link.is_alive(),
                None => false,
            }
        }
    })
    .await;

    let mut stream = pool.connect(&address).await.unwrap();
    echo_round_trip(&mut stream, b"second").await;
    assert_eq!(pool.link_count().await, 1);
}

/// A peer that goes away and comes back on the same address is picked up again.
#[tokio::test]
async fn test_reconnect_after_server_restart() {
    init_tracing();
    let (listener, address) = echo_server(Config::default()).await;
    let pool = Arc::new(Pool::new(
        Config::default().with_reconnect_interval(Duration::from_millis(100)),
    ));

    let mut stream = pool.dial("tcp", &address).await.unwrap();
    echo_round_trip(&mut stream, b"before").await;

    listener.close().await;
    drop(listener);
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .expect("Timeout waiting for EOF")
        .unwrap();
    assert_eq!(n, 0);

    // Rebind the same port once the old socket is released
    let restarted = tokio::time::timeout(TIMEOUT, async {
        loop {
            match Listener::bind(address.as_str(), Config::default()).await {
                Ok(listener) => break listener,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("Timeout rebinding listener");

    let check = (pool.clone(), address.clone());
    wait_until("link to restarted server", || {
        let (pool, address) = check.clone();
        async move { pool.is_connected(&address).await }
    })
    .await;

    let mut stream = pool.connect(&address).await.unwrap();
    stream.write_all(b"after").await.unwrap();
    let mut server = tokio::time::timeout(TIMEOUT, restarted.accept())
        .await
        .expect("Timeout accepting after restart")
        .unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after");
}

/// The accepting side drops links that stop pinging.
#[tokio::test]
async fn test_idle_timeout() {
    init_tracing();
    let server_config = Config::default()
        .with_idle_timeout(Duration::from_millis(300))
        .with_idle_check_interval(Duration::from_millis(50));
    let (listener, address) = echo_server(server_config).await;

    // One ping at link start, then silence
    let pool = Pool::new(Config::default().with_keepalive_interval(Duration::from_secs(60)));
    let mut stream = pool.dial("tcp", &address).await.unwrap();
    echo_round_trip(&mut stream, b"hello").await;

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .expect("Idle link was not dropped")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(stream.close_reason(), Some(CloseReason::Link));

    let check = listener.clone();
    wait_until("listener to forget idle link", || {
        let listener = check.clone();
        async move { listener.link_count().await == 0 }
    })
    .await;
}

/// Pings keep a quiet link alive past the idle timeout.
#[tokio::test]
async fn test_keepalive_prevents_idle_timeout() {
    init_tracing();
    let server_config = Config::default()
        .with_idle_timeout(Duration::from_millis(300))
        .with_idle_check_interval(Duration::from_millis(50));
    let (listener, address) = echo_server(server_config).await;

    let pool = Pool::new(Config::default().with_keepalive_interval(Duration::from_millis(50)));
    let mut stream = pool.dial("tcp", &address).await.unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;

    assert!(!stream.is_closed());
    echo_round_trip(&mut stream, b"still here").await;
    assert_eq!(listener.link_count().await, 1);
}

/// Read deadlines are enforced on real streams.
#[tokio::test]
async fn test_read_deadline() {
    init_tracing();
    let (_listener, address) = echo_server(Config::default()).await;
    let pool = Pool::new(Config::default());

    let mut stream = pool.dial("tcp", &address).await.unwrap();
    stream.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(100)));

    let mut buf = [0u8; 1];
    let err = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .expect("Deadline did not fire")
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    stream.set_read_deadline(None);
    echo_round_trip(&mut stream, b"ok").await;
}

/// A peer that sends data for a stream the dialer never opened has its link
/// torn down.
#[tokio::test]
async fn test_protocol_violation_drops_link() {
    init_tracing();
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = server.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (socket, _) = server.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        let mut packets = FramedRead::new(read_half, PacketCodec::default());
        let mut sink = FramedWrite::new(write_half, PacketCodec::default());

        // Wait for the first stream, then answer on an ID that was never issued
        while let Some(Ok(packet)) = packets.next().await {
            if !packet.is_ping() {
                let _ = sink.send(Packet::data(packet.stream_id + 1000, &b"bogus"[..])).await;
                break;
            }
        }
        // Keep the socket open; only the violation should end the link
        while packets.next().await.is_some() {}
    });

    let pool = Pool::new(Config::default().with_reconnect_interval(Duration::from_secs(60)));
    let mut stream = pool.dial("tcp", &address).await.unwrap();
    stream.write_all(b"hi").await.unwrap();

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(TIMEOUT, stream.read(&mut buf))
        .await
        .expect("Link survived a protocol violation")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(stream.close_reason(), Some(CloseReason::Link));
}

/// Closing a listener ends accept() and tears its links down.
#[tokio::test]
async fn test_listener_close() {
    init_tracing();
    let listener = Arc::new(Listener::bind("127.0.0.1:0", Config::default()).await.unwrap());
    let address = listener.local_addr().to_string();
    let pool = Pool::new(Config::default().with_reconnect_interval(Duration::from_secs(60)));

    let mut client = pool.dial("tcp", &address).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let _server = listener.accept().await.unwrap();

    let waiting = listener.clone();
    let pending_accept = tokio::spawn(async move { waiting.accept().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    listener.close().await;

    let result = tokio::time::timeout(TIMEOUT, pending_accept)
        .await
        .expect("accept() not released by close")
        .unwrap();
    assert!(matches!(result, Err(Error::ListenerClosed)));

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(TIMEOUT, client.read(&mut buf))
        .await
        .expect("Timeout waiting for EOF")
        .unwrap();
    assert_eq!(n, 0);
}
