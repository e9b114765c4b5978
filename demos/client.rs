//! Simple client example
//!
//! Dials the echo server through a pool, sends random payloads over a few
//! concurrent streams and verifies the echo.
//!
//! Usage: `cargo run --example client [server_address] [streams]`

use rand::Rng;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info};
use vnet::{Config, Pool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,vnet=debug")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let address = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:9000".to_string());
    let streams: usize = match args.get(2) {
        Some(n) => n.parse()?,
        None => 4,
    };

    let pool = Arc::new(Pool::new(Config::default()));
    info!("Dialing {} with {} streams", address, streams);

    let mut handles = Vec::new();
    for i in 0..streams {
        let pool = pool.clone();
        let address = address.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_stream(&pool, &address, i).await {
                error!("Stream {} failed: {}", i, e);
                return false;
            }
            true
        }));
    }

    let mut ok = 0;
    for handle in handles {
        if handle.await? {
            ok += 1;
        }
    }
    info!("{}/{} streams echoed correctly", ok, streams);

    pool.shutdown().await;
    if ok != streams {
        std::process::exit(1);
    }

    Ok(())
}

async fn run_stream(pool: &Pool, address: &str, index: usize) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = pool.dial("tcp", address).await?;
    info!("Stream {} opened (id {})", index, stream.id());

    let mut payload = {
        let mut rng = rand::thread_rng();
        vec![0u8; rng.gen_range(1..=8192)]
    };
    rand::thread_rng().fill(&mut payload[..]);

    stream.write_all(&payload).await?;

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).await?;
    if echoed != payload {
        return Err(format!("echo mismatch on stream {}", stream.id()).into());
    }
    info!(
        "Stream {}: {} bytes echoed, starting {}",
        index,
        payload.len(),
        hex::encode(&payload[..payload.len().min(8)])
    );

    stream.shutdown().await?;
    Ok(())
}
