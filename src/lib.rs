//! Virtual stream multiplexing over persistent TCP links
//!
//! This crate carries many lightweight virtual streams over a small pool of
//! long-lived TCP connections, one per remote address. It allows
//! applications to:
//!
//! - Open streams without paying for a TCP handshake each time
//! - Use standard Rust async I/O traits (AsyncRead, AsyncWrite)
//! - Survive link loss: the dialing side reconnects in the background
//! - Detect dead peers through keepalive pings and an idle timeout
//!
//! # Architecture
//!
//! ```text
//! Application
//!     ↓
//! Pool (dial side)        Listener (accept side)
//!     ↓                          ↓
//! Link: stream table, demux loop, writer task
//!     ↓
//! PacketCodec over TcpStream
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use vnet::{Config, Listener, Pool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = Listener::bind("127.0.0.1:9000", Config::default()).await?;
//!     tokio::spawn(async move {
//!         while let Ok(stream) = listener.accept().await {
//!             tokio::spawn(async move {
//!                 let (mut r, mut w) = tokio::io::split(stream);
//!                 let _ = tokio::io::copy(&mut r, &mut w).await;
//!             });
//!         }
//!     });
//!
//!     // Retries while the physical link comes up
//!     let pool = Pool::new(Config::default());
//!     let mut stream = pool.dial("tcp", "127.0.0.1:9000").await?;
//!
//!     stream.write_all(b"hello").await?;
//!     let mut buf = [0u8; 5];
//!     stream.read_exact(&mut buf).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod listener;
pub mod pool;
pub mod protocol;
pub mod stream;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use link::{Link, Role};
pub use listener::Listener;
pub use pool::Pool;
pub use protocol::{Flag, Packet, PacketCodec, HEADER_SIZE};
pub use stream::{CloseReason, Stream};
