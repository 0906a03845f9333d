//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use xds_core::net::{Acceptor, InboundConnection};
use xds_core::resolver::{ResolutionSink, ResolverError, ResolverState};
use xds_core::server::{ServingModeCallback, ServingModeChange};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Long enough for a queued event to be processed if it was going to be.
pub const SHORT_WAIT: Duration = Duration::from_millis(100);

/// Await `fut`, failing the test after `TEST_TIMEOUT`.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("timed out waiting for event")
}

/// Assert `fut` does not complete within `SHORT_WAIT`.
pub async fn assert_pending<F: Future>(fut: F, what: &str) {
    if tokio::time::timeout(SHORT_WAIT, fut).await.is_ok() {
        panic!("unexpected: {what}");
    }
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// A connection that reports fixed addresses and signals when it is dropped.
#[derive(Debug)]
pub struct FakeConn {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    _closed: oneshot::Sender<()>,
}

impl FakeConn {
    /// The receiver resolves once the connection has been dropped.
    pub fn new(local: &str, remote: &str) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                local: addr(local),
                remote: addr(remote),
                _closed: tx,
            },
            rx,
        )
    }
}

impl InboundConnection for FakeConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote)
    }
}

/// Listener whose accept results are pushed by the test.
pub struct FakeAcceptor {
    addr: SocketAddr,
    rx: Mutex<mpsc::UnboundedReceiver<io::Result<FakeConn>>>,
}

impl FakeAcceptor {
    pub fn new(local: &str) -> (Self, mpsc::UnboundedSender<io::Result<FakeConn>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                addr: addr(local),
                rx: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl Acceptor for FakeAcceptor {
    type Conn = FakeConn;

    fn accept(&self) -> impl Future<Output = io::Result<FakeConn>> + Send {
        async move {
            match self.rx.lock().await.recv().await {
                Some(res) => res,
                None => Err(io::Error::new(io::ErrorKind::NotConnected, "fake listener closed")),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Resolution sink forwarding everything to channels.
pub struct RecordingSink {
    states: mpsc::UnboundedSender<ResolverState>,
    errors: mpsc::UnboundedSender<ResolverError>,
}

pub struct SinkEvents {
    pub states: mpsc::UnboundedReceiver<ResolverState>,
    pub errors: mpsc::UnboundedReceiver<ResolverError>,
}

impl RecordingSink {
    pub fn new() -> (Arc<Self>, SinkEvents) {
        let (states_tx, states) = mpsc::unbounded_channel();
        let (errors_tx, errors) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                states: states_tx,
                errors: errors_tx,
            }),
            SinkEvents { states, errors },
        )
    }
}

impl ResolutionSink for RecordingSink {
    fn update_state(&self, state: ResolverState) {
        let _ = self.states.send(state);
    }

    fn report_error(&self, err: ResolverError) {
        let _ = self.errors.send(err);
    }
}

impl SinkEvents {
    pub async fn next_state(&mut self) -> ResolverState {
        within(self.states.recv()).await.expect("sink dropped")
    }

    pub async fn next_error(&mut self) -> ResolverError {
        within(self.errors.recv()).await.expect("sink dropped")
    }
}

/// Serving mode callback forwarding changes to a channel.
pub fn mode_recorder() -> (
    ServingModeCallback,
    mpsc::UnboundedReceiver<(SocketAddr, ServingModeChange)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: ServingModeCallback = Arc::new(move |addr: SocketAddr, change: ServingModeChange| {
        let _ = tx.send((addr, change));
    });
    (callback, rx)
}
