use http::{HeaderMap, StatusCode};

use crate::Protocol;

/// Canonical gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

/// Derives a gRPC-style status code and message from the completed upstream
/// response, according to the wire protocol of the call.
pub fn extract_status(
    protocol: Protocol,
    http_status: StatusCode,
    headers: &HeaderMap,
    trailers: Option<&HeaderMap>,
) -> (i32, String) {
    match protocol {
        Protocol::Grpc | Protocol::GrpcWeb => extract_grpc_status(headers, trailers),
        Protocol::Connect => extract_connect_status(http_status),
    }
}

/// Reads `grpc-status` from trailers first, then from headers. Some
/// implementations surface immediate errors in headers (trailers-only
/// responses). An absent status means OK; an unparsable one coerces to 0.
fn extract_grpc_status(headers: &HeaderMap, trailers: Option<&HeaderMap>) -> (i32, String) {
    if let Some(trailers) = trailers {
        if let Some(status) = header_str(trailers, "grpc-status") {
            return (
                parse_status_code(status),
                header_str(trailers, "grpc-message")
                    .unwrap_or_default()
                    .to_string(),
            );
        }
    }
    if let Some(status) = header_str(headers, "grpc-status") {
        return (
            parse_status_code(status),
            header_str(headers, "grpc-message")
                .unwrap_or_default()
                .to_string(),
        );
    }
    (Code::Ok as i32, String::new())
}

/// Connect carries status in the HTTP layer: 200 is OK, everything else maps
/// into the canonical code space per the Connect specification.
fn extract_connect_status(http_status: StatusCode) -> (i32, String) {
    if http_status == StatusCode::OK {
        return (Code::Ok as i32, String::new());
    }
    let message = match http_status.canonical_reason() {
        Some(reason) => format!("{} {}", http_status.as_u16(), reason),
        None => http_status.as_u16().to_string(),
    };
    (http_status_to_code(http_status) as i32, message)
}

/// The Connect specification's httpToCode table.
fn http_status_to_code(http_status: StatusCode) -> Code {
    match http_status.as_u16() {
        400 => Code::Internal,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::Unimplemented,
        429 => Code::Unavailable,
        502 | 503 | 504 => Code::Unavailable,
        _ => Code::Unknown,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_status_code(text: &str) -> i32 {
    text.trim().parse::<i32>().unwrap_or(0)
}
