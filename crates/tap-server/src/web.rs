//! Optional web surface: an embedded index page, a Server-Sent Events feed
//! of captured calls, and a JSON replay endpoint.
//!
//! Bodies cross this boundary base64-encoded because the channel is textual;
//! the internal event model stays raw bytes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use tap_http::MAX_CAPTURE_SIZE;
use tap_observe::{Event, EventBus};
use tap_proxy::ReplayHandler;

use crate::proto::flatten_headers;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
struct WebState {
    bus: EventBus,
    replay: Arc<dyn ReplayHandler>,
}

pub fn router(bus: EventBus, replay: Arc<dyn ReplayHandler>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/events", get(stream_events))
        .route("/api/replay", post(replay_call))
        .layer(DefaultBodyLimit::max(2 * MAX_CAPTURE_SIZE))
        .with_state(WebState { bus, replay })
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Serialize)]
struct EventJson {
    id: String,
    method: String,
    call_type: String,
    protocol: String,
    start_time: String,
    duration_ms: f64,
    status: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    request_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    response_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    request_body: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    response_body: String,
}

fn event_to_json(event: &Event) -> EventJson {
    EventJson {
        id: event.id.clone(),
        method: event.method.clone(),
        call_type: event.call_type.as_str().to_string(),
        protocol: event.protocol.as_str().to_string(),
        start_time: DateTime::<Utc>::from(event.start_time)
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        duration_ms: event.duration.as_micros() as f64 / 1000.0,
        status: event.status,
        error: event.error.clone(),
        request_headers: flatten_headers(&event.request_headers),
        response_headers: flatten_headers(&event.response_headers),
        request_body: encode_body(&event.request_body),
        response_body: encode_body(&event.response_body),
    }
}

fn encode_body(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    BASE64.encode(data)
}

async fn stream_events(
    State(state): State<WebState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (receiver, subscription) = state.bus.subscribe();
    let stream = ReceiverStream::new(receiver).map(move |event| {
        // The subscription must live exactly as long as the stream; moving
        // it into the closure ties unsubscribe to client disconnect.
        let _ = &subscription;
        let data = serde_json::to_string(&event_to_json(&event)).unwrap_or_else(|_| "{}".into());
        Ok(SseEvent::default().data(data))
    });
    Sse::new(stream)
}

#[derive(Debug, Deserialize)]
struct ReplayRequestBody {
    #[serde(default)]
    method: String,
    #[serde(default)]
    request_body: String,
}

#[derive(Debug, Serialize)]
struct ReplayResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<EventJson>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn replay_call(
    State(state): State<WebState>,
    payload: Result<Json<ReplayRequestBody>, JsonRejection>,
) -> (StatusCode, Json<ReplayResponseBody>) {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {rejection}"),
            );
        }
    };

    if request.method.is_empty() || !request.method.starts_with('/') {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid method: must be a non-empty path starting with '/'".to_string(),
        );
    }

    let body = match BASE64.decode(request.request_body.as_bytes()) {
        Ok(body) => body,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid base64 body: {error}"),
            );
        }
    };

    if body.len() > MAX_CAPTURE_SIZE {
        return error_response(
            StatusCode::BAD_REQUEST,
            "request body too large".to_string(),
        );
    }

    match state.replay.replay(&request.method, &body).await {
        Ok(event) => (
            StatusCode::OK,
            Json(ReplayResponseBody {
                event: Some(event_to_json(&event)),
                error: None,
            }),
        ),
        Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ReplayResponseBody>) {
    (
        status,
        Json(ReplayResponseBody {
            event: None,
            error: Some(message),
        }),
    )
}
