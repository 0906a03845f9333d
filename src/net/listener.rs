//! Listener abstraction and TCP implementation.
//!
//! # Responsibilities
//! - Bind to a socket address
//! - Accept incoming connections through the `Acceptor` trait
//! - Classify accept errors into temporary (retry with backoff) and fatal

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::net::connection::InboundConnection;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(io::Error),

    /// The listener could not report its local address.
    #[error("Failed to read local address: {0}")]
    LocalAddr(io::Error),

    /// Non-temporary accept failure. The accept loop ends.
    #[error("Failed to accept: {0}")]
    Accept(io::Error),

    /// The listener was closed.
    #[error("Listener closed")]
    Closed,
}

/// A source of inbound connections.
pub trait Acceptor: Send + Sync + 'static {
    type Conn: InboundConnection;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    type Conn = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<TcpStream>> + Send {
        async move {
            let (stream, _) = TcpListener::accept(self).await?;
            Ok(stream)
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Bind a TCP listener.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ListenerError> {
    let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;

    let local_addr = listener.local_addr().map_err(ListenerError::LocalAddr)?;
    tracing::info!(address = %local_addr, "Listener bound");

    Ok(listener)
}

// ENOMEM, ENFILE, EMFILE, ENOBUFS
#[cfg(target_os = "linux")]
const RESOURCE_ERRNOS: [i32; 4] = [12, 23, 24, 105];
#[cfg(all(unix, not(target_os = "linux")))]
const RESOURCE_ERRNOS: [i32; 4] = [12, 23, 24, 55];
#[cfg(not(unix))]
const RESOURCE_ERRNOS: [i32; 0] = [];

/// Whether an accept error is transient and worth retrying after a backoff.
pub fn is_temporary(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }

    err.raw_os_error()
        .is_some_and(|code| RESOURCE_ERRNOS.contains(&code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_kinds() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::TimedOut,
        ] {
            assert!(is_temporary(&io::Error::from(kind)), "{kind:?}");
        }

        assert!(!is_temporary(&io::Error::from(io::ErrorKind::InvalidInput)));
        assert!(!is_temporary(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_too_many_open_files_is_temporary() {
        assert!(is_temporary(&io::Error::from_raw_os_error(24)));
        assert!(!is_temporary(&io::Error::from_raw_os_error(9)));
    }

    #[tokio::test]
    async fn test_bind_and_accept() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = Acceptor::local_addr(&listener).unwrap();

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let conn = Acceptor::accept(&listener).await.unwrap();
        let client = client.await.unwrap();

        assert_eq!(conn.local_addr().unwrap(), addr);
        assert_eq!(conn.peer_addr().unwrap(), client.local_addr().unwrap());
    }
}
