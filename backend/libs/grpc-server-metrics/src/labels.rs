//! Label model: call shapes, method identities and status code labels

use std::borrow::Cow;
use std::fmt;

use tonic::Code;

/// Message cardinality of an RPC in each direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// One request, one response
    Unary,
    /// Client streams requests, server answers once
    ClientStream,
    /// Client sends once, server streams responses
    ServerStream,
    /// Both sides stream
    BidiStream,
}

impl CallShape {
    /// Derive the shape from the streaming direction flags of a method
    pub fn from_streaming(client_streams: bool, server_streams: bool) -> Self {
        match (client_streams, server_streams) {
            (false, false) => CallShape::Unary,
            (true, false) => CallShape::ClientStream,
            (false, true) => CallShape::ServerStream,
            (true, true) => CallShape::BidiStream,
        }
    }

    /// Value of the `grpc_type` label
    pub fn as_label(&self) -> &'static str {
        match self {
            CallShape::Unary => "unary",
            CallShape::ClientStream => "client_stream",
            CallShape::ServerStream => "server_stream",
            CallShape::BidiStream => "bidi_stream",
        }
    }

    pub fn is_streaming(&self) -> bool {
        !matches!(self, CallShape::Unary)
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Service and method name of an RPC, split from `/package.Service/Method`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    pub service: String,
    pub method: String,
}

impl MethodIdentity {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Split a fully qualified method path at its last `/`.
    ///
    /// Never fails: malformed paths degrade to whatever labels can be
    /// recovered, so a bad path never breaks the call it belongs to.
    pub fn from_path(path: &str) -> Self {
        let trimmed = path.strip_prefix('/').unwrap_or(path);

        let identity = match trimmed.rsplit_once('/') {
            Some((service, method)) => Self::new(service, method),
            None => Self::new("", trimmed),
        };

        if !identity.is_well_formed() {
            tracing::debug!(
                path = %path,
                service = %identity.service,
                method = %identity.method,
                "Malformed gRPC method path, using best-effort labels"
            );
        }

        identity
    }

    /// Both components present
    pub fn is_well_formed(&self) -> bool {
        !self.service.is_empty() && !self.method.is_empty()
    }

    /// Fully qualified path, `/service/method`
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.method)
    }
}

/// Every status code a gRPC server can terminate a call with
pub const ALL_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

/// Value of the `grpc_code` label.
///
/// Uses the canonical names shared by the other gRPC ecosystems so that
/// existing dashboards keep matching.
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Label for a raw `grpc-status` header value.
///
/// Numeric values outside the known set keep their raw text so they are
/// still counted; unparsable values count as `Unknown`.
pub fn status_label_from_header(value: &[u8]) -> Cow<'static, str> {
    let parsed = std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());

    match parsed {
        Some(raw) if (0..ALL_CODES.len() as i32).contains(&raw) => {
            Cow::Borrowed(code_label(Code::from_i32(raw)))
        }
        Some(raw) => Cow::Owned(raw.to_string()),
        None => Cow::Borrowed(code_label(Code::Unknown)),
    }
}
