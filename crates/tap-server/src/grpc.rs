use std::future::poll_fn;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use tap_http::{extract_payload, Code};
use tap_observe::EventBus;
use tap_proxy::ReplayHandler;

use crate::proto::{event_to_proto, ReplayRequest, ReplayResponse, WatchResponse};

const WATCH_PATH: &str = "/tap.v1.TapService/Watch";
const REPLAY_PATH: &str = "/tap.v1.TapService/Replay";

/// Serves the `tap.v1.TapService` RPC surface to UI clients: a streaming
/// `Watch` subscription backed by the event bus, and a unary `Replay` that
/// forwards to the replay capability.
pub struct TapServer {
    bus: EventBus,
    replay: Arc<dyn ReplayHandler>,
}

impl TapServer {
    pub fn new(bus: EventBus, replay: Arc<dyn ReplayHandler>) -> Self {
        Self { bus, replay }
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut connections = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (tcp, _) = accepted?;
                    let server = Arc::clone(&self);
                    connections.spawn(async move { server.serve_connection(tcp).await });
                }
            }
        }
        connections.shutdown().await;
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, tcp: TcpStream) -> io::Result<()> {
        let mut connection = match h2::server::handshake(tcp).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!(%error, "tap service HTTP/2 handshake failed");
                return Ok(());
            }
        };

        let mut streams = tokio::task::JoinSet::new();
        while let Some(next_stream) = connection.accept().await {
            match next_stream {
                Ok((request, respond)) => {
                    let server = Arc::clone(&self);
                    streams.spawn(async move { server.handle_stream(request, respond).await });
                }
                Err(error) => {
                    tracing::debug!(%error, "tap service stream accept failed");
                    break;
                }
            }
        }
        while let Some(joined) = streams.join_next().await {
            if let Ok(Err(error)) = joined {
                tracing::debug!(%error, "tap service stream failed");
            }
        }
        Ok(())
    }

    async fn handle_stream(
        &self,
        request: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
    ) -> io::Result<()> {
        match request.uri().path() {
            WATCH_PATH => self.watch(request, respond).await,
            REPLAY_PATH => self.replay_unary(request, respond).await,
            unknown => respond_trailers_only(
                &mut respond,
                Code::Unimplemented as i32,
                &format!("unknown method {unknown}"),
            ),
        }
    }

    /// Streams every bus event to the client until it disconnects or the bus
    /// shuts down. The subscription is dropped (and thereby removed) on
    /// every exit path.
    async fn watch(
        &self,
        request: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
    ) -> io::Result<()> {
        let mut request_body = request.into_body();
        let _ = read_framed_body(&mut request_body).await;

        let (mut events, _subscription) = self.bus.subscribe();
        let mut stream = send_grpc_headers(&mut respond)?;

        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else { break };
                    let frame = encode_grpc_frame(&WatchResponse {
                        event: Some(event_to_proto(&event)),
                    });
                    if send_frame(&mut stream, frame).await.is_err() {
                        // Client went away mid-send; nothing left to write.
                        return Ok(());
                    }
                }
                _ = poll_fn(|cx| stream.poll_reset(cx)) => {
                    return Ok(());
                }
            }
        }

        send_grpc_trailers(&mut stream, Code::Ok as i32, "")
    }

    async fn replay_unary(
        &self,
        request: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
    ) -> io::Result<()> {
        let mut request_body = request.into_body();
        let framed = match read_framed_body(&mut request_body).await {
            Ok(framed) => framed,
            Err(error) => {
                return respond_trailers_only(
                    &mut respond,
                    Code::Internal as i32,
                    &format!("reading replay request failed: {error}"),
                );
            }
        };

        let payload = extract_payload(framed);
        let replay_request = match ReplayRequest::decode(payload.as_ref()) {
            Ok(message) => message,
            Err(error) => {
                return respond_trailers_only(
                    &mut respond,
                    Code::InvalidArgument as i32,
                    &format!("invalid replay request: {error}"),
                );
            }
        };

        match self
            .replay
            .replay(&replay_request.method, &replay_request.request_body)
            .await
        {
            Ok(event) => {
                let mut stream = send_grpc_headers(&mut respond)?;
                let frame = encode_grpc_frame(&ReplayResponse {
                    event: Some(event_to_proto(&event)),
                });
                send_frame(&mut stream, frame).await?;
                send_grpc_trailers(&mut stream, Code::Ok as i32, "")
            }
            Err(error) => {
                respond_trailers_only(&mut respond, Code::Unknown as i32, &error.to_string())
            }
        }
    }
}

/// Wraps an encoded message in the uncompressed gRPC frame envelope.
fn encode_grpc_frame(message: &impl Message) -> Bytes {
    let encoded = message.encode_to_vec();
    let mut frame = Vec::with_capacity(5 + encoded.len());
    frame.push(0);
    frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    frame.extend_from_slice(&encoded);
    Bytes::from(frame)
}

async fn read_framed_body(body: &mut h2::RecvStream) -> io::Result<Bytes> {
    let mut data = Vec::new();
    while let Some(next_chunk) = body.data().await {
        let chunk =
            next_chunk.map_err(|error| h2_error_to_io("reading request body failed", error))?;
        data.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    let _ = body
        .trailers()
        .await
        .map_err(|error| h2_error_to_io("reading request trailers failed", error))?;
    Ok(Bytes::from(data))
}

fn send_grpc_headers(
    respond: &mut h2::server::SendResponse<Bytes>,
) -> io::Result<h2::SendStream<Bytes>> {
    let response = http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .body(())
        .map_err(|error| io::Error::other(format!("build grpc response: {error}")))?;
    respond
        .send_response(response, false)
        .map_err(|error| h2_error_to_io("sending grpc response headers failed", error))
}

async fn send_frame(stream: &mut h2::SendStream<Bytes>, mut frame: Bytes) -> io::Result<()> {
    while !frame.is_empty() {
        stream.reserve_capacity(frame.len());
        let available = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(capacity)) if capacity > 0 => capacity,
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                return Err(h2_error_to_io("polling send capacity failed", error));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream closed before capacity became available",
                ));
            }
        };
        let chunk = frame.split_to(available.min(frame.len()));
        stream
            .send_data(chunk, false)
            .map_err(|error| h2_error_to_io("sending response frame failed", error))?;
    }
    Ok(())
}

fn send_grpc_trailers(
    stream: &mut h2::SendStream<Bytes>,
    code: i32,
    message: &str,
) -> io::Result<()> {
    let mut trailers = http::HeaderMap::new();
    trailers.insert(
        "grpc-status",
        http::HeaderValue::from_str(&code.to_string())
            .map_err(|error| io::Error::other(format!("grpc-status header: {error}")))?,
    );
    if !message.is_empty() {
        if let Ok(value) = http::HeaderValue::from_str(message) {
            trailers.insert("grpc-message", value);
        }
    }
    stream
        .send_trailers(trailers)
        .map_err(|error| h2_error_to_io("sending grpc trailers failed", error))
}

/// gRPC trailers-only response: status carried directly in the headers frame.
fn respond_trailers_only(
    respond: &mut h2::server::SendResponse<Bytes>,
    code: i32,
    message: &str,
) -> io::Result<()> {
    let mut builder = http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/grpc")
        .header("grpc-status", code.to_string());
    if !message.is_empty() {
        if let Ok(value) = http::HeaderValue::from_str(message) {
            builder = builder.header("grpc-message", value);
        }
    }
    let response = builder
        .body(())
        .map_err(|error| io::Error::other(format!("build trailers-only response: {error}")))?;
    respond
        .send_response(response, true)
        .map_err(|error| h2_error_to_io("sending trailers-only response failed", error))?;
    Ok(())
}

fn h2_error_to_io(context: &str, error: h2::Error) -> io::Error {
    io::Error::other(format!("{context}: {error}"))
}
