use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use tap_http::{CallType, Protocol};
use tap_observe::Event;
use tap_proxy::ReverseProxy;

fn frame_grpc_message(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(0);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

async fn read_body_and_trailers(body: &mut h2::RecvStream) -> (Vec<u8>, Option<http::HeaderMap>) {
    let mut payload = Vec::new();
    while let Some(next_chunk) = body.data().await {
        let chunk = next_chunk.expect("read body chunk");
        payload.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    let trailers = body.trailers().await.expect("read trailers");
    (payload, trailers)
}

fn header_value<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn start_proxy(
    upstream_origin: &str,
) -> (
    Arc<ReverseProxy>,
    std::net::SocketAddr,
    watch::Sender<bool>,
    mpsc::Receiver<Event>,
) {
    let proxy = Arc::new(ReverseProxy::new("127.0.0.1:0", upstream_origin).expect("build proxy"));
    let events = proxy.take_events().expect("events receiver");
    let listener = proxy.bind().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&proxy).run_with_listener(listener, shutdown_rx));
    (proxy, addr, shutdown_tx, events)
}

async fn connect_client(
    addr: std::net::SocketAddr,
) -> (
    h2::client::SendRequest<Bytes>,
    tokio::task::JoinHandle<()>,
) {
    let tcp = TcpStream::connect(addr).await.expect("connect proxy");
    let (client, connection) = h2::client::handshake(tcp).await.expect("h2c handshake");
    let connection_task = tokio::spawn(async move {
        let _ = connection.await;
    });
    (client, connection_task)
}

async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

async fn shutdown_upstream(mut h2_conn: h2::server::Connection<TcpStream, Bytes>) {
    h2_conn.graceful_shutdown();
    let _ = tokio::time::timeout(Duration::from_millis(250), async {
        let _ = poll_fn(|cx| h2_conn.poll_closed(cx)).await;
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unary_grpc_success_emits_ok_event() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");

    let upstream_task = tokio::spawn(async move {
        let (tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let mut h2_conn = h2::server::handshake(tcp).await.expect("h2 handshake");
        let (request, mut respond) = h2_conn
            .accept()
            .await
            .expect("missing stream")
            .expect("accept stream");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(request.uri().path(), "/test.Service/Echo");
        assert_eq!(
            header_value(request.headers(), "content-type"),
            Some("application/grpc")
        );
        assert_eq!(header_value(request.headers(), "te"), Some("trailers"));

        let mut body = request.into_body();
        let (payload, request_trailers) = read_body_and_trailers(&mut body).await;
        assert_eq!(payload, frame_grpc_message(b"hello"));
        assert!(request_trailers.is_none());

        let response = http::Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .expect("response");
        let mut send = respond.send_response(response, false).expect("send headers");
        send.send_data(Bytes::from(frame_grpc_message(b"world")), false)
            .expect("send payload");
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        send.send_trailers(trailers).expect("send trailers");

        shutdown_upstream(h2_conn).await;
    });

    let (_proxy, proxy_addr, _shutdown, mut events) =
        start_proxy(&format!("http://{upstream_addr}")).await;
    let (mut client, _connection_task) = connect_client(proxy_addr).await;

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{proxy_addr}/test.Service/Echo"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(())
        .expect("request");
    let (response_future, mut request_stream) =
        client.send_request(request, false).expect("send request");
    request_stream
        .send_data(Bytes::from(frame_grpc_message(b"hello")), true)
        .expect("send request payload");

    let response = response_future.await.expect("response");
    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        header_value(response.headers(), "content-type"),
        Some("application/grpc")
    );

    let mut response_body = response.into_body();
    let (payload, trailers) = read_body_and_trailers(&mut response_body).await;
    assert_eq!(payload, frame_grpc_message(b"world"));
    let trailers = trailers.expect("expected trailers");
    assert_eq!(header_value(&trailers, "grpc-status"), Some("0"));

    let event = next_event(&mut events).await;
    assert_eq!(event.method, "/test.Service/Echo");
    assert_eq!(event.protocol, Protocol::Grpc);
    assert_eq!(event.call_type, CallType::Unary);
    assert_eq!(event.status, 0);
    assert_eq!(event.error, "");
    assert_eq!(event.request_body, Bytes::from_static(b"hello"));
    assert_eq!(event.response_body, Bytes::from_static(b"world"));
    assert!(!event.id.is_empty());

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_streaming_classifies_and_keeps_first_payload() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");

    let upstream_task = tokio::spawn(async move {
        let (tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let mut h2_conn = h2::server::handshake(tcp).await.expect("h2 handshake");
        let (request, mut respond) = h2_conn
            .accept()
            .await
            .expect("missing stream")
            .expect("accept stream");

        let mut body = request.into_body();
        let (payload, _) = read_body_and_trailers(&mut body).await;
        assert_eq!(payload, frame_grpc_message(b"req-1"));

        let response = http::Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .expect("response");
        let mut send = respond.send_response(response, false).expect("send headers");
        for message in [b"feature-a".as_slice(), b"feature-b", b"feature-c"] {
            send.send_data(Bytes::from(frame_grpc_message(message)), false)
                .expect("send stream message");
        }
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        send.send_trailers(trailers).expect("send trailers");

        shutdown_upstream(h2_conn).await;
    });

    let (_proxy, proxy_addr, _shutdown, mut events) =
        start_proxy(&format!("http://{upstream_addr}")).await;
    let (mut client, _connection_task) = connect_client(proxy_addr).await;

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{proxy_addr}/route.Guide/ListFeatures"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(())
        .expect("request");
    let (response_future, mut request_stream) =
        client.send_request(request, false).expect("send request");
    request_stream
        .send_data(Bytes::from(frame_grpc_message(b"req-1")), true)
        .expect("send request payload");

    let response = response_future.await.expect("response");
    let mut response_body = response.into_body();
    let (payload, trailers) = read_body_and_trailers(&mut response_body).await;
    let mut expected = frame_grpc_message(b"feature-a");
    expected.extend_from_slice(&frame_grpc_message(b"feature-b"));
    expected.extend_from_slice(&frame_grpc_message(b"feature-c"));
    assert_eq!(payload, expected);
    assert!(trailers.is_some());

    let event = next_event(&mut events).await;
    assert_eq!(event.call_type, CallType::ServerStream);
    assert_eq!(event.status, 0);
    assert_eq!(event.request_body, Bytes::from_static(b"req-1"));
    assert_eq!(event.response_body, Bytes::from_static(b"feature-a"));

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grpc_error_in_trailer_surfaces_status_and_message() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");

    let upstream_task = tokio::spawn(async move {
        let (tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let mut h2_conn = h2::server::handshake(tcp).await.expect("h2 handshake");
        let (request, mut respond) = h2_conn
            .accept()
            .await
            .expect("missing stream")
            .expect("accept stream");

        let mut body = request.into_body();
        let _ = read_body_and_trailers(&mut body).await;

        let response = http::Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .expect("response");
        let mut send = respond.send_response(response, false).expect("send headers");
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("5"));
        trailers.insert("grpc-message", http::HeaderValue::from_static("not found"));
        send.send_trailers(trailers).expect("send trailers");

        shutdown_upstream(h2_conn).await;
    });

    let (_proxy, proxy_addr, _shutdown, mut events) =
        start_proxy(&format!("http://{upstream_addr}")).await;
    let (mut client, _connection_task) = connect_client(proxy_addr).await;

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{proxy_addr}/test.Service/Lookup"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(())
        .expect("request");
    let (response_future, mut request_stream) =
        client.send_request(request, false).expect("send request");
    request_stream
        .send_data(Bytes::from(frame_grpc_message(b"missing-key")), true)
        .expect("send request payload");

    let response = response_future.await.expect("response");
    let mut response_body = response.into_body();
    let (payload, trailers) = read_body_and_trailers(&mut response_body).await;
    assert!(payload.is_empty());
    let trailers = trailers.expect("expected trailers");
    assert_eq!(header_value(&trailers, "grpc-status"), Some("5"));
    assert_eq!(header_value(&trailers, "grpc-message"), Some("not found"));

    let event = next_event(&mut events).await;
    assert_eq!(event.status, 5);
    assert_eq!(event.error, "not found");
    assert_eq!(event.call_type, CallType::Unary);
    assert!(event.response_body.is_empty());

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_non_ok_maps_http_status_into_code_space() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");

    let upstream_task = tokio::spawn(async move {
        let (tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let mut h2_conn = h2::server::handshake(tcp).await.expect("h2 handshake");
        let (request, mut respond) = h2_conn
            .accept()
            .await
            .expect("missing stream")
            .expect("accept stream");

        let mut body = request.into_body();
        let (payload, _) = read_body_and_trailers(&mut body).await;
        assert_eq!(payload, b"raw-proto-bytes");

        let response = http::Response::builder()
            .status(401)
            .body(())
            .expect("response");
        respond.send_response(response, true).expect("send response");

        shutdown_upstream(h2_conn).await;
    });

    let (_proxy, proxy_addr, _shutdown, mut events) =
        start_proxy(&format!("http://{upstream_addr}")).await;
    let (mut client, _connection_task) = connect_client(proxy_addr).await;

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{proxy_addr}/test.Service/Echo"))
        .header("content-type", "application/proto")
        .body(())
        .expect("request");
    let (response_future, mut request_stream) =
        client.send_request(request, false).expect("send request");
    request_stream
        .send_data(Bytes::from_static(b"raw-proto-bytes"), true)
        .expect("send request payload");

    let response = response_future.await.expect("response");
    assert_eq!(response.status(), http::StatusCode::UNAUTHORIZED);

    let event = next_event(&mut events).await;
    assert_eq!(event.protocol, Protocol::Connect);
    assert_eq!(event.call_type, CallType::Unary);
    assert_eq!(event.status, 16);
    assert_eq!(event.error, "401 Unauthorized");
    assert_eq!(event.request_body, Bytes::from_static(b"raw-proto-bytes"));

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bidi_streaming_classifies_from_both_frame_counts() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");

    let upstream_task = tokio::spawn(async move {
        let (tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let mut h2_conn = h2::server::handshake(tcp).await.expect("h2 handshake");
        let (request, mut respond) = h2_conn
            .accept()
            .await
            .expect("missing stream")
            .expect("accept stream");

        let mut body = request.into_body();
        let _ = read_body_and_trailers(&mut body).await;

        let response = http::Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .expect("response");
        let mut send = respond.send_response(response, false).expect("send headers");
        send.send_data(Bytes::from(frame_grpc_message(b"pong-1")), false)
            .expect("send message");
        send.send_data(Bytes::from(frame_grpc_message(b"pong-2")), false)
            .expect("send message");
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        send.send_trailers(trailers).expect("send trailers");

        shutdown_upstream(h2_conn).await;
    });

    let (_proxy, proxy_addr, _shutdown, mut events) =
        start_proxy(&format!("http://{upstream_addr}")).await;
    let (mut client, _connection_task) = connect_client(proxy_addr).await;

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{proxy_addr}/chat.Chat/Converse"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(())
        .expect("request");
    let (response_future, mut request_stream) =
        client.send_request(request, false).expect("send request");
    request_stream
        .send_data(Bytes::from(frame_grpc_message(b"ping-1")), false)
        .expect("send message");
    request_stream
        .send_data(Bytes::from(frame_grpc_message(b"ping-2")), true)
        .expect("send message");

    let response = response_future.await.expect("response");
    let mut response_body = response.into_body();
    let _ = read_body_and_trailers(&mut response_body).await;

    let event = next_event(&mut events).await;
    assert_eq!(event.call_type, CallType::BidiStream);
    assert_eq!(event.request_body, Bytes::from_static(b"ping-1"));
    assert_eq!(event.response_body, Bytes::from_static(b"pong-1"));

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_synthesizes_unary_call_and_publishes_event() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream_listener.local_addr().expect("upstream addr");

    let upstream_task = tokio::spawn(async move {
        let (tcp, _) = upstream_listener.accept().await.expect("accept upstream");
        let mut h2_conn = h2::server::handshake(tcp).await.expect("h2 handshake");
        let (request, mut respond) = h2_conn
            .accept()
            .await
            .expect("missing stream")
            .expect("accept stream");
        assert_eq!(request.uri().path(), "/test.Service/Echo");
        assert_eq!(
            header_value(request.headers(), "content-type"),
            Some("application/grpc")
        );
        assert_eq!(header_value(request.headers(), "te"), Some("trailers"));

        let mut body = request.into_body();
        let (payload, _) = read_body_and_trailers(&mut body).await;
        assert_eq!(payload, frame_grpc_message(&[0x68, 0x65, 0x6c, 0x6c, 0x6f]));

        let response = http::Response::builder()
            .status(200)
            .header("content-type", "application/grpc")
            .body(())
            .expect("response");
        let mut send = respond.send_response(response, false).expect("send headers");
        send.send_data(Bytes::from(frame_grpc_message(b"resp")), false)
            .expect("send payload");
        let mut trailers = http::HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        send.send_trailers(trailers).expect("send trailers");

        shutdown_upstream(h2_conn).await;
    });

    let proxy = ReverseProxy::new("127.0.0.1:0", &format!("http://{upstream_addr}"))
        .expect("build proxy");
    let mut events = proxy.take_events().expect("events receiver");

    let event = proxy
        .replay("/test.Service/Echo", &[0x68, 0x65, 0x6c, 0x6c, 0x6f])
        .await
        .expect("replay");
    assert_eq!(event.method, "/test.Service/Echo");
    assert_eq!(event.protocol, Protocol::Grpc);
    assert_eq!(event.call_type, CallType::Unary);
    assert_eq!(event.status, 0);
    assert_eq!(event.request_body, Bytes::from_static(b"hello"));
    assert_eq!(event.response_body, Bytes::from_static(b"resp"));

    let published = next_event(&mut events).await;
    assert_eq!(published.id, event.id);

    upstream_task.await.expect("upstream task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_rejects_method_without_leading_slash() {
    let proxy = ReverseProxy::new("127.0.0.1:0", "http://127.0.0.1:1").expect("build proxy");
    let error = proxy
        .replay("test.Service/Echo", b"hello")
        .await
        .expect_err("must reject");
    assert!(error.to_string().contains("must be a path"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_upstream_responds_502_and_emits_no_event() {
    // Reserve a port, then close it so nothing is listening there.
    let reserved = TcpListener::bind("127.0.0.1:0").await.expect("reserve port");
    let dead_addr = reserved.local_addr().expect("dead addr");
    drop(reserved);

    let (_proxy, proxy_addr, _shutdown, mut events) =
        start_proxy(&format!("http://{dead_addr}")).await;
    let (mut client, _connection_task) = connect_client(proxy_addr).await;

    let request = http::Request::builder()
        .method("POST")
        .uri(format!("http://{proxy_addr}/test.Service/Echo"))
        .header("content-type", "application/grpc")
        .body(())
        .expect("request");
    let (response_future, mut request_stream) =
        client.send_request(request, false).expect("send request");
    request_stream
        .send_data(Bytes::from(frame_grpc_message(b"hello")), true)
        .expect("send request payload");

    let response = response_future.await.expect("response");
    assert_eq!(response.status(), http::StatusCode::BAD_GATEWAY);

    assert!(matches!(
        events.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    ));
}
