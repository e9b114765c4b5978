use std::io;

use thiserror::Error;

/// Errors that can occur in vnet operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the physical link
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (malformed packet, packet for an unknown stream, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No physical link to the address yet; a dial has been queued
    #[error("Link to {0} not yet established")]
    NotConnected(String),

    /// Only "tcp" is supported
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// Stream already closed
    #[error("Stream closed")]
    StreamClosed,

    /// Physical link closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Listener closed, no more streams will be accepted
    #[error("Listener closed")]
    ListenerClosed,

    /// Dialing the physical link timed out
    #[error("Operation timed out")]
    Timeout,

    /// Packet too large
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),
}

impl Error {
    /// Whether the caller should retry the operation later.
    ///
    /// `NotConnected` means the pool is establishing the link in the
    /// background; a retry after a short delay is expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotConnected(_) | Error::Timeout)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::StreamClosed | Error::ConnectionClosed | Error::ListenerClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, e)
            }
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            Error::NotConnected(_) => io::Error::new(io::ErrorKind::NotConnected, e),
            Error::UnsupportedNetwork(_) => io::Error::new(io::ErrorKind::Unsupported, e),
            Error::Protocol(_) | Error::PacketTooLarge(..) => {
                io::Error::new(io::ErrorKind::InvalidData, e)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::NotConnected("127.0.0.1:1".into()).is_retryable());
        assert!(Error::Timeout.is_retryable());
        assert!(!Error::StreamClosed.is_retryable());
        assert!(!Error::Protocol("bad".into()).is_retryable());
    }

    #[test]
    fn test_into_io_error_kind() {
        let e: io::Error = Error::StreamClosed.into();
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);

        let e: io::Error = Error::Timeout.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);

        let e: io::Error = Error::PacketTooLarge(10, 5).into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
    }
}
