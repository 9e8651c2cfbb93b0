use std::io;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::relay::h2_error_to_io;
use crate::ProxyError;

/// Shared HTTP/2 cleartext client transport to the configured upstream.
///
/// One connection is dialed lazily and multiplexes every proxied stream;
/// [`UpstreamTransport::ready_sender`] hands out a per-stream clone and
/// re-dials transparently when the connection has gone away.
#[derive(Debug)]
pub(crate) struct UpstreamTransport {
    authority: String,
    sender: Mutex<Option<h2::client::SendRequest<Bytes>>>,
}

impl UpstreamTransport {
    pub(crate) fn from_origin(origin: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| ProxyError::InvalidUpstream {
            origin: origin.to_string(),
            reason: reason.to_string(),
        };

        let uri: http::Uri = origin.parse().map_err(|_| invalid("not a valid URI"))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(_) => return Err(invalid("only cleartext http origins are supported")),
            None => return Err(invalid("missing http scheme")),
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing authority"))?;
        let host = authority.host();
        let port = authority.port_u16().unwrap_or(80);

        Ok(Self {
            authority: format!("{host}:{port}"),
            sender: Mutex::new(None),
        })
    }

    /// Rewrites a downstream path (and query) onto the upstream origin.
    pub(crate) fn request_uri(&self, path_and_query: &str) -> Result<http::Uri, http::Error> {
        format!("http://{}{}", self.authority, path_and_query)
            .parse()
            .map_err(http::Error::from)
    }

    /// Returns a send handle that is ready to carry one more stream. A stale
    /// or never-dialed connection is (re)established under the lock, so
    /// concurrent callers share one dial.
    pub(crate) async fn ready_sender(&self) -> io::Result<h2::client::SendRequest<Bytes>> {
        let mut guard = self.sender.lock().await;
        if let Some(existing) = guard.clone() {
            match existing.ready().await {
                Ok(ready) => return Ok(ready),
                Err(_) => {
                    *guard = None;
                }
            }
        }

        let sender = self.dial().await?;
        *guard = Some(sender.clone());
        sender
            .ready()
            .await
            .map_err(|error| h2_error_to_io("upstream HTTP/2 sender not ready", error))
    }

    async fn dial(&self) -> io::Result<h2::client::SendRequest<Bytes>> {
        let tcp = TcpStream::connect(&self.authority).await?;
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(crate::H2_INITIAL_WINDOW_SIZE)
            .initial_connection_window_size(crate::H2_INITIAL_CONNECTION_WINDOW_SIZE)
            .max_send_buffer_size(crate::H2_MAX_SEND_BUFFER_SIZE);
        let (sender, connection) = builder
            .handshake(tcp)
            .await
            .map_err(|error| h2_error_to_io("upstream HTTP/2 handshake failed", error))?;

        let authority = self.authority.clone();
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(%authority, %error, "upstream HTTP/2 connection closed");
            }
        });

        Ok(sender)
    }
}
