use std::future::Future;
use std::pin::Pin;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use uuid::Uuid;

use tap_http::{extract_payload, extract_status, CallType, Protocol};
use tap_observe::Event;

use crate::relay::send_data_with_backpressure;
use crate::{ReplayError, ReverseProxy};

/// Capability to synthesize a unary call against the upstream, handed to the
/// service layer so it never depends on the proxy type directly.
pub trait ReplayHandler: Send + Sync {
    fn replay<'a>(
        &'a self,
        method: &'a str,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Event, ReplayError>> + Send + 'a>>;
}

impl ReplayHandler for ReverseProxy {
    fn replay<'a>(
        &'a self,
        method: &'a str,
        body: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Event, ReplayError>> + Send + 'a>> {
        Box::pin(ReverseProxy::replay(self, method, body))
    }
}

impl ReverseProxy {
    /// Sends a gRPC unary request built from `method` and raw protobuf
    /// `body` bytes (unframed) to the upstream, returning the resulting
    /// event. The event is also published to the event channel, dropped
    /// there if the channel is full.
    pub async fn replay(&self, method: &str, body: &[u8]) -> Result<Event, ReplayError> {
        if !method.starts_with('/') {
            return Err(ReplayError::InvalidMethod(method.to_string()));
        }

        let start_time = SystemTime::now();
        let started = Instant::now();

        // Single uncompressed length-prefixed frame around the payload.
        let mut frame = Vec::with_capacity(5 + body.len());
        frame.push(0);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        let uri = self
            .transport
            .request_uri(method)
            .map_err(|_| ReplayError::InvalidMethod(method.to_string()))?;
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .version(http::Version::HTTP_2)
            .header(http::header::CONTENT_TYPE, "application/grpc")
            .header(http::header::TE, "trailers")
            .body(())
            .map_err(|error| ReplayError::Transport(error.to_string()))?;
        let request_headers = request.headers().clone();

        let mut sender = self
            .transport
            .ready_sender()
            .await
            .map_err(|error| ReplayError::Transport(error.to_string()))?;
        let (response_future, mut request_stream) = sender
            .send_request(request, false)
            .map_err(|error| ReplayError::Transport(error.to_string()))?;
        send_data_with_backpressure(&mut request_stream, Bytes::from(frame), true)
            .await
            .map_err(|error| ReplayError::Transport(error.to_string()))?;

        let response = response_future
            .await
            .map_err(|error| ReplayError::Transport(error.to_string()))?;
        let (response_parts, mut response_body) = response.into_parts();

        let mut data = Vec::new();
        while let Some(next_chunk) = response_body.data().await {
            let chunk = next_chunk.map_err(|error| ReplayError::Read(error.to_string()))?;
            data.extend_from_slice(&chunk);
            let _ = response_body.flow_control().release_capacity(chunk.len());
        }
        let trailers = response_body
            .trailers()
            .await
            .map_err(|error| ReplayError::Read(error.to_string()))?;

        let (status, error) = extract_status(
            Protocol::Grpc,
            response_parts.status,
            &response_parts.headers,
            trailers.as_ref(),
        );
        let response_payload = extract_payload(Bytes::from(data));

        let event = Event {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            call_type: CallType::Unary,
            protocol: Protocol::Grpc,
            start_time,
            duration: started.elapsed(),
            status,
            error,
            request_headers,
            response_headers: response_parts.headers,
            request_body: Bytes::copy_from_slice(body),
            response_body: response_payload,
        };
        let _ = self.events_tx.try_send(event.clone());
        Ok(event)
    }
}
