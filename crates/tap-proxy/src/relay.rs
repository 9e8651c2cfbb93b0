use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use tokio::net::TcpStream;
use uuid::Uuid;

use tap_http::{
    decompress_gzip, detect_call_type, detect_protocol, extract_payload, extract_status,
    CaptureBuffer, FrameCounter, Protocol, MAX_CAPTURE_SIZE,
};
use tap_observe::Event;

use crate::ReverseProxy;

/// Per-direction passive observer: bounded capture plus, for length-prefixed
/// protocols, a frame counter. Strictly per-stream state.
struct StreamInspector {
    capture: CaptureBuffer,
    frames: Option<FrameCounter>,
}

impl StreamInspector {
    fn new(protocol: Protocol) -> Self {
        let frames = matches!(protocol, Protocol::Grpc | Protocol::GrpcWeb)
            .then(FrameCounter::new);
        Self {
            capture: CaptureBuffer::new(MAX_CAPTURE_SIZE),
            frames,
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        self.capture.observe(chunk);
        if let Some(frames) = self.frames.as_mut() {
            frames.observe(chunk);
        }
    }

    fn frame_count(&self) -> u64 {
        self.frames.as_ref().map(FrameCounter::count).unwrap_or(0)
    }

    fn captured(&self) -> Bytes {
        Bytes::copy_from_slice(self.capture.as_slice())
    }
}

impl ReverseProxy {
    pub(crate) async fn serve_connection(self: Arc<Self>, tcp: TcpStream) -> io::Result<()> {
        let mut builder = h2::server::Builder::new();
        builder
            .max_concurrent_streams(crate::H2_MAX_CONCURRENT_STREAMS)
            .initial_window_size(crate::H2_INITIAL_WINDOW_SIZE)
            .initial_connection_window_size(crate::H2_INITIAL_CONNECTION_WINDOW_SIZE)
            .max_send_buffer_size(crate::H2_MAX_SEND_BUFFER_SIZE);

        let mut connection = match builder.handshake(tcp).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!(%error, "downstream HTTP/2 handshake failed");
                return Ok(());
            }
        };

        let mut streams = tokio::task::JoinSet::new();
        while let Some(next_stream) = connection.accept().await {
            match next_stream {
                Ok((request, respond)) => {
                    let proxy = Arc::clone(&self);
                    streams.spawn(async move { proxy.relay_stream(request, respond).await });
                }
                Err(error) => {
                    if !is_h2_transport_close_error(&error) {
                        tracing::debug!(%error, "downstream HTTP/2 accept failed");
                    }
                    break;
                }
            }
        }

        while let Some(joined) = streams.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::debug!(%error, "stream relay failed"),
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => tracing::debug!(%join_error, "stream task join failed"),
            }
        }
        Ok(())
    }

    /// Forwards one proxied request end-to-end and mints its event.
    ///
    /// Everything up to the upstream response is a proxy failure surface
    /// (502, no event); once response headers have arrived, exactly one event
    /// is emitted no matter how the stream ends.
    async fn relay_stream(
        &self,
        request: http::Request<h2::RecvStream>,
        mut respond: h2::server::SendResponse<Bytes>,
    ) -> io::Result<()> {
        let start_time = SystemTime::now();
        let started = Instant::now();

        let (request_parts, request_body) = request.into_parts();
        let content_type = request_parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let protocol = detect_protocol(&content_type);
        let method = request_parts.uri.path().to_string();
        let request_headers = request_parts.headers.clone();

        let path_and_query = request_parts
            .uri
            .path_and_query()
            .map(|paq| paq.as_str())
            .unwrap_or("/");
        let upstream_uri = match self.transport.request_uri(path_and_query) {
            Ok(uri) => uri,
            Err(error) => return respond_bad_gateway(&mut respond, error.to_string()),
        };

        let mut upstream_request = http::Request::builder()
            .method(request_parts.method.clone())
            .uri(upstream_uri)
            .version(http::Version::HTTP_2);
        if let Some(headers) = upstream_request.headers_mut() {
            *headers = request_parts.headers.clone();
        }
        let upstream_request = match upstream_request.body(()) {
            Ok(request) => request,
            Err(error) => return respond_bad_gateway(&mut respond, error.to_string()),
        };

        let mut sender = match self.transport.ready_sender().await {
            Ok(sender) => sender,
            Err(error) => return respond_bad_gateway(&mut respond, error.to_string()),
        };

        let request_end_stream = request_body.is_end_stream();
        let (response_future, upstream_request_stream) =
            match sender.send_request(upstream_request, request_end_stream) {
                Ok(parts) => parts,
                Err(error) => return respond_bad_gateway(&mut respond, error.to_string()),
            };

        // The request body relays on its own task so bidirectional streams
        // keep flowing while the response side is drained below.
        let request_inspector = Arc::new(Mutex::new(StreamInspector::new(protocol)));
        let request_task = (!request_end_stream).then(|| {
            let inspector = Arc::clone(&request_inspector);
            tokio::spawn(relay_request_body(
                request_body,
                upstream_request_stream,
                inspector,
            ))
        });

        let upstream_response = match response_future.await {
            Ok(response) => response,
            Err(error) => {
                if let Some(task) = request_task {
                    task.abort();
                }
                return respond_bad_gateway(&mut respond, error.to_string());
            }
        };

        let (response_parts, mut upstream_response_body) = upstream_response.into_parts();
        let response_headers = response_parts.headers.clone();
        let upstream_status = response_parts.status;

        let mut response_inspector = StreamInspector::new(protocol);
        let response_end_stream = upstream_response_body.is_end_stream();
        let downstream_response = http::Response::from_parts(response_parts, ());

        let mut trailers = None;
        match respond.send_response(downstream_response, response_end_stream) {
            Ok(mut downstream_stream) => {
                if !response_end_stream {
                    match relay_body(
                        &mut upstream_response_body,
                        &mut downstream_stream,
                        |chunk| response_inspector.observe(chunk),
                    )
                    .await
                    {
                        Ok(observed) => trailers = observed,
                        Err(error) => {
                            tracing::debug!(%error, %method, "response relay ended early");
                        }
                    }
                }
            }
            Err(error) => {
                tracing::debug!(%error, %method, "client went away before response headers");
            }
        }

        // The RPC is over once the response side finishes; stop whatever is
        // left of the request relay so the counts are final.
        if let Some(task) = request_task {
            task.abort();
            let _ = task.await;
        }

        let (request_frames, captured_request) = {
            let inspector = request_inspector.lock().expect("lock poisoned");
            (inspector.frame_count(), inspector.captured())
        };
        let call_type = detect_call_type(
            protocol,
            &content_type,
            request_frames,
            response_inspector.frame_count(),
        );
        let (status, error) = extract_status(
            protocol,
            upstream_status,
            &response_headers,
            trailers.as_ref(),
        );
        let captured_response = response_inspector.captured();
        let (request_body, response_body) = match protocol {
            Protocol::Grpc | Protocol::GrpcWeb => (
                extract_payload(captured_request),
                extract_payload(captured_response),
            ),
            Protocol::Connect => (
                decompress_gzip(captured_request),
                decompress_gzip(captured_response),
            ),
        };

        let event = Event {
            id: Uuid::new_v4().to_string(),
            method,
            call_type,
            protocol,
            start_time,
            duration: started.elapsed(),
            status,
            error,
            request_headers,
            response_headers,
            request_body,
            response_body,
        };
        let _ = self.events_tx.send(event).await;
        Ok(())
    }
}

async fn relay_request_body(
    mut source: h2::RecvStream,
    mut sink: h2::SendStream<Bytes>,
    inspector: Arc<Mutex<StreamInspector>>,
) -> io::Result<()> {
    relay_body(&mut source, &mut sink, |chunk| {
        inspector.lock().expect("lock poisoned").observe(chunk);
    })
    .await
    .map(|_trailers| ())
}

/// Streams `source` into `sink` chunk by chunk, feeding each chunk to the
/// observer, then forwards trailers (or an empty end-of-stream frame).
/// Returns the trailers that were forwarded, if any.
async fn relay_body<F>(
    source: &mut h2::RecvStream,
    sink: &mut h2::SendStream<Bytes>,
    mut observe: F,
) -> io::Result<Option<http::HeaderMap>>
where
    F: FnMut(&[u8]),
{
    while let Some(next_data) = source.data().await {
        let data =
            next_data.map_err(|error| h2_error_to_io("reading HTTP/2 body frame failed", error))?;
        let frame_len = data.len();
        if frame_len == 0 {
            continue;
        }

        observe(&data);
        send_data_with_backpressure(sink, data, false).await?;
        source
            .flow_control()
            .release_capacity(frame_len)
            .map_err(|error| h2_error_to_io("releasing HTTP/2 receive capacity failed", error))?;
    }

    match source
        .trailers()
        .await
        .map_err(|error| h2_error_to_io("reading HTTP/2 trailers failed", error))?
    {
        Some(trailers) => {
            let observed = trailers.clone();
            sink.send_trailers(trailers)
                .map_err(|error| h2_error_to_io("sending HTTP/2 trailers failed", error))?;
            Ok(Some(observed))
        }
        None => {
            send_data_with_backpressure(sink, Bytes::new(), true).await?;
            Ok(None)
        }
    }
}

pub(crate) async fn send_data_with_backpressure(
    sink: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> io::Result<()> {
    if data.is_empty() {
        sink.send_data(data, end_stream)
            .map_err(|error| h2_error_to_io("sending HTTP/2 data frame failed", error))?;
        return Ok(());
    }

    while !data.is_empty() {
        let available_capacity = wait_for_capacity(sink, data.len()).await?;
        let send_len = available_capacity
            .min(data.len())
            .min(crate::H2_FORWARD_CHUNK_LIMIT);
        if send_len == 0 {
            continue;
        }
        let chunk = data.split_to(send_len);
        let is_last = data.is_empty();
        sink.send_data(chunk, end_stream && is_last)
            .map_err(|error| h2_error_to_io("sending HTTP/2 data frame failed", error))?;
    }

    Ok(())
}

async fn wait_for_capacity(
    sink: &mut h2::SendStream<Bytes>,
    desired: usize,
) -> io::Result<usize> {
    sink.reserve_capacity(desired);
    loop {
        match std::future::poll_fn(|cx| sink.poll_capacity(cx)).await {
            Some(Ok(capacity)) if capacity > 0 => return Ok(capacity),
            Some(Ok(_)) => continue,
            Some(Err(error)) => {
                return Err(h2_error_to_io("polling HTTP/2 send capacity failed", error));
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "HTTP/2 send stream closed before capacity became available",
                ));
            }
        }
    }
}

fn respond_bad_gateway(
    respond: &mut h2::server::SendResponse<Bytes>,
    detail: String,
) -> io::Result<()> {
    let body = Bytes::from(detail);
    let response = http::Response::builder()
        .status(http::StatusCode::BAD_GATEWAY)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .header(http::header::CONTENT_LENGTH, body.len().to_string())
        .body(())
        .map_err(|error| io::Error::other(format!("build 502 response: {error}")))?;
    let mut stream = respond
        .send_response(response, body.is_empty())
        .map_err(|error| h2_error_to_io("sending 502 response failed", error))?;
    if !body.is_empty() {
        stream
            .send_data(body, true)
            .map_err(|error| h2_error_to_io("sending 502 body failed", error))?;
    }
    Ok(())
}

pub(crate) fn h2_error_to_io(context: &str, error: h2::Error) -> io::Error {
    io::Error::other(format!("{context}: {error}"))
}

fn is_h2_transport_close_error(error: &h2::Error) -> bool {
    error.is_io() || error.is_go_away()
}
