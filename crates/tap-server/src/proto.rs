//! Hand-maintained message types for the `tap.v1.TapService` boundary.
//!
//! The wire schema is the contract with external UI clients; the structs
//! below carry prost field attributes so the encoding matches a generated
//! `tap/v1/tap.proto` exactly.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CallType {
    Unspecified = 0,
    Unary = 1,
    ServerStream = 2,
    ClientStream = 3,
    BidiStream = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Protocol {
    Unspecified = 0,
    Grpc = 1,
    GrpcWeb = 2,
    Connect = 3,
}

/// `google.protobuf.Timestamp`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

/// `google.protobuf.Duration`.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct ProtoDuration {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GrpcEvent {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(enumeration = "CallType", tag = "3")]
    pub call_type: i32,
    #[prost(message, optional, tag = "4")]
    pub start_time: Option<Timestamp>,
    #[prost(message, optional, tag = "5")]
    pub duration: Option<ProtoDuration>,
    #[prost(int32, tag = "6")]
    pub status: i32,
    #[prost(string, tag = "7")]
    pub error: String,
    #[prost(enumeration = "Protocol", tag = "8")]
    pub protocol: i32,
    #[prost(bytes = "vec", tag = "9")]
    pub request_body: Vec<u8>,
    #[prost(bytes = "vec", tag = "10")]
    pub response_body: Vec<u8>,
    #[prost(map = "string, string", tag = "11")]
    pub request_headers: HashMap<String, String>,
    #[prost(map = "string, string", tag = "12")]
    pub response_headers: HashMap<String, String>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct WatchRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WatchResponse {
    #[prost(message, optional, tag = "1")]
    pub event: Option<GrpcEvent>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplayRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(bytes = "vec", tag = "2")]
    pub request_body: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplayResponse {
    #[prost(message, optional, tag = "1")]
    pub event: Option<GrpcEvent>,
}

pub fn event_to_proto(event: &tap_observe::Event) -> GrpcEvent {
    GrpcEvent {
        id: event.id.clone(),
        method: event.method.clone(),
        call_type: call_type_to_proto(event.call_type) as i32,
        start_time: Some(timestamp_from(event.start_time)),
        duration: Some(duration_from(event.duration)),
        status: event.status,
        error: event.error.clone(),
        protocol: protocol_to_proto(event.protocol) as i32,
        request_body: event.request_body.to_vec(),
        response_body: event.response_body.to_vec(),
        request_headers: flatten_headers(&event.request_headers),
        response_headers: flatten_headers(&event.response_headers),
    }
}

/// Collapses a multi-valued header map into the boundary's flat map by
/// joining values with `", "`.
pub fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut flat = HashMap::with_capacity(headers.keys_len());
    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        flat.insert(name.as_str().to_string(), joined);
    }
    flat
}

fn call_type_to_proto(call_type: tap_http::CallType) -> CallType {
    match call_type {
        tap_http::CallType::Unary => CallType::Unary,
        tap_http::CallType::ServerStream => CallType::ServerStream,
        tap_http::CallType::ClientStream => CallType::ClientStream,
        tap_http::CallType::BidiStream => CallType::BidiStream,
    }
}

fn protocol_to_proto(protocol: tap_http::Protocol) -> Protocol {
    match protocol {
        tap_http::Protocol::Grpc => Protocol::Grpc,
        tap_http::Protocol::GrpcWeb => Protocol::GrpcWeb,
        tap_http::Protocol::Connect => Protocol::Connect,
    }
}

fn timestamp_from(time: SystemTime) -> Timestamp {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => Timestamp {
            seconds: since_epoch.as_secs() as i64,
            nanos: since_epoch.subsec_nanos() as i32,
        },
        Err(_) => Timestamp::default(),
    }
}

fn duration_from(duration: Duration) -> ProtoDuration {
    ProtoDuration {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}
