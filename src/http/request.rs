//! The request handed to handlers: parsed head, decoded body and kind.

use crate::{
    errors::{Error, Result},
    http::{
        body::Body,
        head::RequestHead,
        multipart::{self, Multipart},
        types::{Method, Version},
    },
    limits::MultipartLimits,
    query::{Query, QueryCollector},
    ws::handshake,
};
use std::{collections::HashMap, net::SocketAddr};

/// A complete HTTP request.
///
/// Created by the server for every accepted connection once the head has
/// passed both [gates](crate::RequestGate) and the body has been read. For
/// WebSocket upgrade requests the body is not read; [`kind`](Self::kind)
/// carries the handshake data instead and the socket stays with the server
/// until the handler answers with `101 Switching Protocols`.
///
/// # Examples
/// ```
/// use kiln::{Handled, Request, Response, StatusCode};
///
/// async fn handle(req: &Request, resp: &mut Response) -> Handled {
///     let name = req.query("name").unwrap_or("world");
///
///     resp.status(StatusCode::OK)
///         .header("content-type", "text/plain")
///         .body(format!("hello, {name} (via {})", req.method()))
/// }
/// ```
#[derive(Debug)]
pub struct Request {
    head: RequestHead,
    body: Body,
    kind: RequestKind,
    peer_addr: Option<SocketAddr>,
    multipart_limits: MultipartLimits,
}

/// What the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Http,
    WebSocketUpgrade(Upgrade),
}

/// WebSocket handshake data sent by the client.
///
/// Detected when `Connection` lists `upgrade`, `Upgrade` is `websocket` and a
/// `Sec-WebSocket-Key` header is present (all case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upgrade {
    key: String,
    protocols: Vec<String>,
    version: Option<String>,
    extensions: Vec<String>,
}

impl Request {
    pub(crate) fn new(
        head: RequestHead,
        body: Body,
        peer_addr: Option<SocketAddr>,
        multipart_limits: MultipartLimits,
    ) -> Self {
        let kind = match Upgrade::detect(&head) {
            Some(upgrade) => RequestKind::WebSocketUpgrade(upgrade),
            None => RequestKind::Http,
        };

        Self {
            head,
            body,
            kind,
            peer_addr,
            multipart_limits,
        }
    }

    #[inline(always)]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    #[inline(always)]
    pub fn method(&self) -> Method {
        self.head.method()
    }

    #[inline(always)]
    pub fn uri(&self) -> &str {
        self.head.uri()
    }

    #[inline(always)]
    pub fn path(&self) -> &str {
        self.head.path()
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.head.version()
    }

    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    #[inline(always)]
    pub fn headers(&self) -> &[(String, String)] {
        self.head.headers()
    }

    #[inline(always)]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.head.query(key)
    }

    #[inline(always)]
    pub fn query_params(&self) -> &HashMap<String, String> {
        self.head.query_params()
    }

    #[inline(always)]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.head.cookie(name)
    }

    #[inline(always)]
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.head.cookies()
    }

    #[inline(always)]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Takes the body out of the request, leaving [`Body::None`].
    #[inline]
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    #[inline(always)]
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// Handshake data for WebSocket upgrade requests.
    #[inline]
    pub fn upgrade(&self) -> Option<&Upgrade> {
        match &self.kind {
            RequestKind::WebSocketUpgrade(upgrade) => Some(upgrade),
            RequestKind::Http => None,
        }
    }

    #[inline]
    pub fn is_websocket(&self) -> bool {
        matches!(self.kind, RequestKind::WebSocketUpgrade(_))
    }

    #[inline(always)]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The `Range` header, when it holds a single byte range.
    pub fn range(&self) -> Option<ByteRange> {
        self.header("range").and_then(ByteRange::parse)
    }

    /// Parameters of an `application/x-www-form-urlencoded` body.
    ///
    /// Returns `None` for other content types and for bodies that are not
    /// in memory or not UTF-8.
    pub fn form<C: QueryCollector>(&self) -> Option<C> {
        let content_type = self.head.content_type()?;
        let mime = content_type.split(';').next().unwrap_or_default().trim();
        if !mime.eq_ignore_ascii_case("application/x-www-form-urlencoded") {
            return None;
        }

        let data = simdutf8::basic::from_utf8(self.body.as_bytes()?).ok()?;
        Some(Query::parse(data))
    }

    /// Decodes a `multipart/form-data` body.
    ///
    /// File parts are streamed into temporary files owned by the returned
    /// [`Multipart`]. Fails with [`Error::Unsupported`] when the content type
    /// is not multipart or has no boundary.
    pub async fn multipart(&self) -> Result<Multipart> {
        let boundary = self
            .head
            .content_type()
            .and_then(multipart::boundary)
            .ok_or(Error::Unsupported("content-type"))?;

        Multipart::decode(&self.body, boundary, &self.multipart_limits).await
    }
}

impl Upgrade {
    pub(crate) fn detect(head: &RequestHead) -> Option<Self> {
        let upgrade = head.header_has_token("connection", "upgrade")
            && head
                .header("upgrade")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("websocket"));
        if !upgrade {
            return None;
        }

        let key = head.header("sec-websocket-key")?.trim();
        if key.is_empty() {
            return None;
        }

        let list = |name: &'static str| -> Vec<String> {
            head.header_all(name)
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        };

        Some(Self {
            key: key.to_string(),
            protocols: list("sec-websocket-protocol"),
            version: head
                .header("sec-websocket-version")
                .map(|value| value.trim().to_string()),
            extensions: list("sec-websocket-extensions"),
        })
    }

    /// The client's `Sec-WebSocket-Key`.
    #[inline(always)]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Requested subprotocols, in order of preference.
    #[inline(always)]
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    #[inline]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    #[inline(always)]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// `true` for `Sec-WebSocket-Version: 13`, the only version spoken.
    #[inline]
    pub fn is_supported_version(&self) -> bool {
        self.version.as_deref() == Some("13")
    }

    /// Value for the `Sec-WebSocket-Accept` response header.
    #[inline]
    pub fn accept_key(&self) -> String {
        handshake::accept_key(&self.key)
    }
}

/// A single byte range from a `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`, both ends inclusive
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last `n` bytes
    Last(u64),
}

impl ByteRange {
    /// Parses a `Range` header value.
    ///
    /// Only one range in `bytes` units is understood; anything else, including
    /// multi-range requests, gives `None` and the full content is served.
    ///
    /// ```
    /// use kiln::ByteRange;
    ///
    /// assert_eq!(ByteRange::parse("bytes=0-99"), Some(ByteRange::FromTo(0, 99)));
    /// assert_eq!(ByteRange::parse("bytes=500-"), Some(ByteRange::From(500)));
    /// assert_eq!(ByteRange::parse("bytes=-20"), Some(ByteRange::Last(20)));
    /// assert_eq!(ByteRange::parse("bytes=0-1,5-9"), None);
    /// ```
    pub fn parse(value: &str) -> Option<Self> {
        let (unit, spec) = value.trim().split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") || spec.contains(',') {
            return None;
        }

        let (start, end) = spec.trim().split_once('-')?;
        let number = |s: &str| crate::http::types::parse_decimal(s.trim().as_bytes());

        match (start.trim().is_empty(), end.trim().is_empty()) {
            (true, true) => None,
            (true, false) => Some(Self::Last(number(end)?)),
            (false, true) => Some(Self::From(number(start)?)),
            (false, false) => {
                let (start, end) = (number(start)?, number(end)?);
                (start <= end).then_some(Self::FromTo(start, end))
            }
        }
    }

    /// Inclusive `(first, last)` byte positions within content of `len`
    /// bytes, or `None` when the range cannot be satisfied.
    pub fn resolve(&self, len: u64) -> Option<(u64, u64)> {
        if len == 0 {
            return None;
        }

        match *self {
            Self::FromTo(start, end) if start < len => Some((start, end.min(len - 1))),
            Self::From(start) if start < len => Some((start, len - 1)),
            Self::Last(n) if n > 0 => Some((len.saturating_sub(n), len - 1)),
            _ => None,
        }
    }
}
