//! Error type shared by every layer of the server.

use crate::{http::types::StatusCode, Version};
use std::io;

/// Every failure the server core can report.
///
/// Errors raised while a request is being read are turned into a best-effort
/// HTTP response by the connection dispatcher (see [`Error::status`]).
/// Errors raised inside a WebSocket loop are returned to whoever called
/// [`WebSocketConnection::run`](crate::WebSocketConnection::run).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be created or bound.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),
    /// Any other socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the connection before the expected data arrived.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// No data arrived (or could be written) within the configured window.
    #[error("socket operation timed out")]
    Timeout,

    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("unsupported HTTP method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("too many header fields")]
    TooManyHeaders,
    #[error("request head is not valid UTF-8")]
    InvalidEncoding,
    #[error("invalid Content-Length value")]
    InvalidContentLength,
    #[error("malformed chunked body: {0}")]
    InvalidChunk(&'static str),
    #[error("malformed multipart body: {0}")]
    InvalidMultipart(&'static str),
    #[error("malformed websocket frame: {0}")]
    InvalidFrame(&'static str),
    #[error("unknown websocket opcode 0x{0:X}")]
    UnknownOpcode(u8),

    /// Declared or accumulated body size went over the ceiling.
    #[error("body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },
    /// A frame or reassembled message went over the configured ceiling.
    #[error("websocket payload exceeds limit of {limit} bytes")]
    FrameTooLarge { limit: u64 },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("file unavailable: {0}")]
    FileUnavailable(#[source] io::Error),
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,
    #[error("server overloaded")]
    Overloaded,
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

macro_rules! http_errors {
    ($($name:ident: $status:expr => $json:literal; )*) => {
        /// Status code sent to the client for this error.
        pub fn status(&self) -> StatusCode {
            match self { $(
                Self::$name { .. } => $status,
            )* }
        }

        #[inline]
        pub(crate) const fn json_body(&self) -> &'static str {
            match self { $(
                Self::$name { .. } => $json,
            )* }
        }
    };
}

impl Error {
    http_errors! {
        Bind: StatusCode::INTERNAL_SERVER_ERROR
            => r#"{"error":"Internal server error","code":"INTERNAL_ERROR"}"#;
        Io: StatusCode::INTERNAL_SERVER_ERROR
            => r#"{"error":"I/O error occurred","code":"IO_ERROR"}"#;
        ConnectionClosed: StatusCode::BAD_REQUEST
            => r#"{"error":"Connection closed","code":"CONNECTION_CLOSED"}"#;
        Timeout: StatusCode::INTERNAL_SERVER_ERROR
            => r#"{"error":"Internal server error","code":"TIMEOUT"}"#;

        InvalidRequestLine: StatusCode::BAD_REQUEST
            => r#"{"error":"Malformed request line","code":"INVALID_REQUEST_LINE"}"#;
        InvalidMethod: StatusCode::BAD_REQUEST
            => r#"{"error":"Invalid HTTP method","code":"INVALID_METHOD"}"#;
        UnsupportedVersion: StatusCode::BAD_REQUEST
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
        InvalidHeader: StatusCode::BAD_REQUEST
            => r#"{"error":"Invalid header format","code":"INVALID_HEADER"}"#;
        LineTooLong: StatusCode::BAD_REQUEST
            => r#"{"error":"Line too long","code":"LINE_TOO_LONG"}"#;
        TooManyHeaders: StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            => r#"{"error":"Too many headers","code":"TOO_MANY_HEADERS"}"#;
        InvalidEncoding: StatusCode::BAD_REQUEST
            => r#"{"error":"Invalid encoding","code":"INVALID_ENCODING"}"#;
        InvalidContentLength: StatusCode::BAD_REQUEST
            => r#"{"error":"Invalid Content-Length","code":"INVALID_CONTENT_LENGTH"}"#;
        InvalidChunk: StatusCode::BAD_REQUEST
            => r#"{"error":"Malformed chunked body","code":"INVALID_CHUNK"}"#;
        InvalidMultipart: StatusCode::BAD_REQUEST
            => r#"{"error":"Malformed multipart body","code":"INVALID_MULTIPART"}"#;
        InvalidFrame: StatusCode::BAD_REQUEST
            => r#"{"error":"Malformed frame","code":"INVALID_FRAME"}"#;
        UnknownOpcode: StatusCode::BAD_REQUEST
            => r#"{"error":"Unknown opcode","code":"UNKNOWN_OPCODE"}"#;

        BodyTooLarge: StatusCode::PAYLOAD_TOO_LARGE
            => r#"{"error":"Request body too large","code":"BODY_TOO_LARGE"}"#;
        FrameTooLarge: StatusCode::PAYLOAD_TOO_LARGE
            => r#"{"error":"Frame too large","code":"FRAME_TOO_LARGE"}"#;

        Unsupported: StatusCode::BAD_REQUEST
            => r#"{"error":"Unsupported request","code":"UNSUPPORTED"}"#;
        FileUnavailable: StatusCode::NOT_FOUND
            => r#"{"error":"Not found","code":"NOT_FOUND"}"#;
        RangeNotSatisfiable: StatusCode::RANGE_NOT_SATISFIABLE
            => r#"{"error":"Range not satisfiable","code":"RANGE_NOT_SATISFIABLE"}"#;
        Overloaded: StatusCode::SERVICE_UNAVAILABLE
            => r#"{"error":"Service temporarily unavailable","code":"SERVICE_UNAVAILABLE"}"#;
    }

    /// `true` when the peer is gone and writing a response is pointless.
    #[inline]
    pub(crate) const fn is_silent(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }

    /// Serializes a complete `Connection: close` error response.
    pub(crate) fn to_http(&self, version: Version, json: bool) -> Vec<u8> {
        let status = self.status();
        let body = if json { self.json_body() } else { "" };

        let mut buf = Vec::with_capacity(128 + body.len());
        status.write_first_line(version, &mut buf);
        buf.extend_from_slice(b"connection: close\r\ncontent-length: ");
        buf.extend_from_slice(body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
        if json {
            buf.extend_from_slice(b"content-type: application/json\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(body.as_bytes());
        buf
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
