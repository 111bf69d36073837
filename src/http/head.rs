//! Request line and header parsing.

use crate::{
    errors::{Error, Result},
    http::{
        reader::BufferedReader,
        types::{self, Method, Version},
    },
    limits::ReqLimits,
    query::Query,
};
use std::{collections::HashMap, sync::OnceLock};
use tokio::io::AsyncRead;

// RFC 7230 §3.5: ignore at least one empty line before the request line
const MAX_LEADING_EMPTY_LINES: usize = 8;

/// Method, target, version and headers of a request.
///
/// Headers are kept in arrival order with their original spelling.
/// Case-insensitive lookups go through a map built on first use, in which a
/// repeated header name keeps its last value. Query parameters and cookies
/// are parsed lazily too.
///
/// # Format
///
/// ```text
/// [METHOD] SP [URI] SP [VERSION] CRLF
/// ([NAME] ":" OWS [VALUE] OWS CRLF)*
/// CRLF
/// ```
/// - `[METHOD]`: any case, see [`Method`]
/// - `[VERSION]`: `HTTP/1.0` or `HTTP/1.1`
/// - A bare `LF` is accepted as a line terminator.
/// - Every line is limited to [`ReqLimits::max_line_size`] bytes and must be
///   valid UTF-8.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    uri: String,
    version: Version,
    headers: Vec<(String, String)>,

    content_length: Option<u64>,
    chunked: bool,

    lookup: OnceLock<HashMap<String, String>>,
    query: OnceLock<HashMap<String, String>>,
    cookies: OnceLock<HashMap<String, String>>,
}

impl RequestHead {
    /// Reads a request head from `reader`, leaving the body unread.
    ///
    /// Errors:
    /// - [`Error::ConnectionClosed`] if the stream ends before the blank line
    /// - [`Error::InvalidRequestLine`] if the request line does not have
    ///   exactly three tokens
    /// - [`Error::InvalidHeader`] for a header line without a colon or name
    pub async fn read<R: AsyncRead + Unpin>(
        reader: &mut BufferedReader<R>,
        limits: &ReqLimits,
    ) -> Result<Self> {
        let mut skipped = 0;
        let (method, uri, version) = loop {
            let line = reader.read_line(limits.max_line_size).await?;
            if line.is_empty() {
                skipped += 1;
                if skipped > MAX_LEADING_EMPTY_LINES {
                    return Err(Error::InvalidRequestLine);
                }
                continue;
            }

            break Self::parse_request_line(line)?;
        };

        let mut head = RequestHead::new(method, uri, version);
        loop {
            let line = reader.read_line(limits.max_line_size).await?;
            if line.is_empty() {
                break;
            }
            if head.headers.len() >= limits.header_count {
                return Err(Error::TooManyHeaders);
            }

            head.parse_header(line)?;
        }

        head.content_length = head.parse_content_length()?;
        head.chunked = head.parse_chunked();
        Ok(head)
    }

    pub(crate) fn new(method: Method, uri: String, version: Version) -> Self {
        Self {
            method,
            uri,
            version,
            headers: Vec::new(),
            content_length: None,
            chunked: false,
            lookup: OnceLock::new(),
            query: OnceLock::new(),
            cookies: OnceLock::new(),
        }
    }

    fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version)> {
        let line = simdutf8::basic::from_utf8(line).map_err(|_| Error::InvalidEncoding)?;

        let mut parts = line.split_ascii_whitespace();
        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidRequestLine);
        };

        Ok((Method::parse(method)?, uri.to_string(), Version::parse(version)?))
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<()> {
        let line = simdutf8::basic::from_utf8(line).map_err(|_| Error::InvalidEncoding)?;
        let (name, value) = line.split_once(':').ok_or(Error::InvalidHeader)?;

        let valid_name = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_graphic() && !matches!(b, b'(' | b')' | b'"' | b',' | b'/'));
        if !valid_name {
            return Err(Error::InvalidHeader);
        }

        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn parse_content_length(&self) -> Result<Option<u64>> {
        let mut result = None;

        for value in self.header_all("content-length") {
            let len = types::parse_decimal(value.as_bytes()).ok_or(Error::InvalidContentLength)?;
            match result {
                Some(prev) if prev != len => return Err(Error::InvalidContentLength),
                _ => result = Some(len),
            }
        }

        Ok(result)
    }

    fn parse_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .and_then(|value| value.rsplit(',').next())
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
    }

    #[cfg(test)]
    pub(crate) fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
        self.lookup = OnceLock::new();
        self.content_length = self.parse_content_length().ok().flatten();
        self.chunked = self.parse_chunked();
    }
}

// Public API
impl RequestHead {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The request target exactly as sent.
    #[inline(always)]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The target up to the first `?`.
    #[inline]
    pub fn path(&self) -> &str {
        self.uri.split_once('?').map_or(&self.uri, |(path, _)| path)
    }

    /// The raw query string after the first `?`, if any.
    #[inline]
    pub fn query_string(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// All header lines in arrival order, duplicates included.
    #[inline(always)]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive header lookup. For repeated headers the last value
    /// is returned.
    pub fn header(&self, name: &str) -> Option<&str> {
        let map = self.lookup.get_or_init(|| {
            self.headers
                .iter()
                .map(|(k, v)| (types::lower_ascii(k), v.clone()))
                .collect()
        });

        match name.bytes().any(|b| b.is_ascii_uppercase()) {
            true => map.get(&types::lower_ascii(name)),
            false => map.get(name),
        }
        .map(String::as_str)
    }

    /// Every value of a header, in arrival order.
    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` if the comma-separated header `name` contains `token`
    /// (case-insensitive), e.g. `Connection: keep-alive, Upgrade`.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Percent-decoded query parameters. Repeated keys keep the last value.
    pub fn query_params(&self) -> &HashMap<String, String> {
        self.query
            .get_or_init(|| self.query_string().map(Query::parse).unwrap_or_default())
    }

    #[inline]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_params().get(key).map(String::as_str)
    }

    /// Cookies from every `Cookie` header. Repeated names keep the last value.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            let mut map = HashMap::new();
            for value in self.header_all("cookie") {
                Query::parse_into(&mut map, value, b';', false);
            }
            map
        })
    }

    #[inline]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(String::as_str)
    }

    #[inline(always)]
    pub const fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// `true` when the final transfer coding is `chunked`.
    #[inline(always)]
    pub const fn is_chunked(&self) -> bool {
        self.chunked
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// `true` for `Expect: 100-continue`.
    #[inline]
    pub fn expects_continue(&self) -> bool {
        self.header("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }
}
