//! Simple echo server example
//!
//! Accepts virtual streams and echoes back any data received.
//!
//! Usage: `cargo run --example echo [listen_address]`

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use vnet::{Config, Listener};

/// Default address for the echo service
const ECHO_ADDRESS: &str = "127.0.0.1:9000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,vnet=debug")
        .init();

    let address = std::env::args().nth(1).unwrap_or_else(|| ECHO_ADDRESS.to_string());
    let listener = Listener::listen("tcp", &address, Config::default()).await?;

    info!("Echo server listening on {}", listener.local_addr());

    // Accept streams in a loop
    loop {
        match listener.accept().await {
            Ok(stream) => {
                info!("Accepted stream {} from {}", stream.id(), stream.peer_addr());

                tokio::spawn(async move {
                    if let Err(e) = handle_stream(stream).await {
                        error!("Stream error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting stream: {}", e);
                break;
            }
        }
    }

    Ok(())
}

async fn handle_stream(mut stream: vnet::Stream) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = vec![0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            info!("Stream {} closed by peer", stream.id());
            break;
        }

        stream.write_all(&buf[..n]).await?;
    }

    Ok(())
}
