use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use tap_observe::Event;

mod relay;
mod replay;
mod transport;

pub use replay::ReplayHandler;

/// Capacity of the proxy's internal event channel feeding the bus.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub(crate) const H2_MAX_CONCURRENT_STREAMS: u32 = 128;
pub(crate) const H2_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const H2_INITIAL_CONNECTION_WINDOW_SIZE: u32 = 262_144;
pub(crate) const H2_MAX_SEND_BUFFER_SIZE: usize = 128 * 1024;
pub(crate) const H2_FORWARD_CHUNK_LIMIT: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid upstream origin {origin:?}: {reason}")]
    InvalidUpstream { origin: String, reason: String },
    #[error("binding {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid method {0:?}: must be a path starting with '/'")]
    InvalidMethod(String),
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("reading upstream response failed: {0}")]
    Read(String),
}

/// HTTP/2 cleartext reverse proxy that captures gRPC, gRPC-Web, and Connect
/// traffic on its way to a single upstream origin.
///
/// Captured-call events land on an internal bounded channel; the owner takes
/// the receiving end once via [`ReverseProxy::take_events`] and feeds it into
/// the event bus. The channel closes when the proxy (and every replay handle
/// to it) is dropped after shutdown.
pub struct ReverseProxy {
    listen_addr: String,
    transport: transport::UpstreamTransport,
    events_tx: mpsc::Sender<Event>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
}

impl ReverseProxy {
    /// Builds a proxy listening on `listen_addr` and forwarding to the
    /// cleartext origin `upstream_origin` (e.g. `http://localhost:9090`).
    pub fn new(
        listen_addr: impl Into<String>,
        upstream_origin: &str,
    ) -> Result<Self, ProxyError> {
        let transport = transport::UpstreamTransport::from_origin(upstream_origin)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            listen_addr: listen_addr.into(),
            transport,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Hands out the captured-event receiver. Returns `None` after the first
    /// call.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.lock().expect("lock poisoned").take()
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })
    }

    /// Accepts h2c connections until `shutdown` flips, then aborts in-flight
    /// streams and returns.
    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut connections = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (tcp, peer_addr) = accepted?;
                    let proxy = Arc::clone(&self);
                    connections.spawn(async move {
                        if let Err(error) = proxy.serve_connection(tcp).await {
                            tracing::debug!(%peer_addr, %error, "connection ended with error");
                        }
                    });
                }
            }
        }
        drop(listener);
        connections.shutdown().await;
        Ok(())
    }
}
