mod framing;
mod status;
mod wire_json;

pub use framing::{decompress_gzip, extract_payload, CaptureBuffer, FrameCounter};
pub use status::{extract_status, Code};
pub use wire_json::{json_to_wire, wire_to_json, wire_to_value, WireCodecError};

/// Maximum number of body bytes captured per stream direction.
pub const MAX_CAPTURE_SIZE: usize = 64 * 1024;

/// Wire protocol carried by an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Grpc,
    GrpcWeb,
    Connect,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grpc => "gRPC",
            Self::GrpcWeb => "gRPC-Web",
            Self::Connect => "Connect",
        }
    }
}

/// RPC call shape, classified from observed message framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Unary,
    ServerStream,
    ClientStream,
    BidiStream,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "Unary",
            Self::ServerStream => "ServerStream",
            Self::ClientStream => "ClientStream",
            Self::BidiStream => "BidiStream",
        }
    }
}

/// Determines the wire protocol from the request `content-type`.
///
/// `application/grpc-web*` is checked before `application/grpc*` because the
/// former is a prefix-extension of the latter. Everything else, including an
/// absent content type, is treated as Connect.
pub fn detect_protocol(content_type: &str) -> Protocol {
    if content_type.starts_with("application/grpc-web") {
        Protocol::GrpcWeb
    } else if content_type.starts_with("application/grpc") {
        Protocol::Grpc
    } else {
        Protocol::Connect
    }
}

/// Classifies the call type once both bodies have fully passed through the
/// proxy, from the final frame counts (`0` when no counter was installed).
///
/// Connect carries no message framing the proxy understands, so streaming is
/// inferred from the `content-type` alone.
pub fn detect_call_type(
    protocol: Protocol,
    content_type: &str,
    request_frames: u64,
    response_frames: u64,
) -> CallType {
    if protocol == Protocol::Connect {
        if content_type.starts_with("application/connect+proto")
            || content_type.starts_with("application/connect+json")
        {
            return CallType::ServerStream;
        }
        return CallType::Unary;
    }

    match (request_frames <= 1, response_frames <= 1) {
        (true, true) => CallType::Unary,
        (true, false) => CallType::ServerStream,
        (false, true) => CallType::ClientStream,
        (false, false) => CallType::BidiStream,
    }
}
