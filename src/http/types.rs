#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

use crate::errors::{Error, Result};
use std::{borrow::Cow, fmt};

// TO LOWER CASE

#[rustfmt::skip]
const ASCII_LOWER: [u8; 256] = [
    //   x0    x1    x2    x3    x4    x5    x6    x7    x8    x9    xA    xB    xC    xD    xE    xF
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, // 0x
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, 0x1F, // 1x
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28, 0x29, 0x2A, 0x2B, 0x2C, 0x2D, 0x2E, 0x2F, // 2x
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, // 3x
    0x40, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l', b'm', b'n', b'o', // 4x
    b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y', b'z', 0x5B, 0x5C, 0x5D, 0x5E, 0x5F, // 5x
    0x60, b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', b'i', b'j', b'k', b'l', b'm', b'n', b'o', // 6x
    b'p', b'q', b'r', b's', b't', b'u', b'v', b'w', b'x', b'y', b'z', 0x7B, 0x7C, 0x7D, 0x7E, 0x7F, // 7x
    0x80, 0x81, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8A, 0x8B, 0x8C, 0x8D, 0x8E, 0x8F, // 8x
    0x90, 0x91, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9A, 0x9B, 0x9C, 0x9D, 0x9E, 0x9F, // 9x
    0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, // Ax
    0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xBB, 0xBC, 0xBD, 0xBE, 0xBF, // Bx
    0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xCB, 0xCC, 0xCD, 0xCE, 0xCF, // Cx
    0xD0, 0xD1, 0xD2, 0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE, 0xDF, // Dx
    0xE0, 0xE1, 0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA, 0xEB, 0xEC, 0xED, 0xEE, 0xEF, // Ex
    0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF, // Fx
];

// TO UPPER CASE (inverse of `ASCII_LOWER` on letters)
const ASCII_UPPER: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = i as u8;
        i += 1;
    }

    i = 0;
    while i < 256 {
        if ASCII_LOWER[i] != i as u8 {
            table[ASCII_LOWER[i] as usize] = i as u8;
        }
        i += 1;
    }
    table
};

/// Lowercases an ASCII header name. Callers validate the input is ASCII.
#[inline]
pub(crate) fn lower_ascii(src: &str) -> String {
    src.bytes().map(|b| ASCII_LOWER[b as usize] as char).collect()
}

#[inline(always)]
pub(crate) fn parse_decimal(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

#[inline(always)]
pub(crate) fn parse_hex(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        let digit = (byte as char).to_digit(16)?;
        result = result.checked_mul(16)?.checked_add(digit as u64)?;
    }

    Some(result)
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 7231, Section 4](https://datatracker.ietf.org/doc/html/rfc7231#section-4)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    /// Parses a method token, normalizing its case first.
    ///
    /// `get`, `Get` and `GET` are all [`Method::Get`]. The mapping is a
    /// fixed ASCII table and does not depend on the process locale.
    pub fn parse(token: &str) -> Result<Self> {
        let src = token.as_bytes();
        let mut buf = [0u8; 7];
        if src.is_empty() || src.len() > buf.len() {
            return Err(Error::InvalidMethod);
        }

        for (dst, &byte) in buf.iter_mut().zip(src) {
            *dst = ASCII_UPPER[byte as usize];
        }

        match &buf[..src.len()] {
            b"GET" => Ok(Method::Get),
            b"POST" => Ok(Method::Post),
            b"PUT" => Ok(Method::Put),
            b"DELETE" => Ok(Method::Delete),
            b"PATCH" => Ok(Method::Patch),
            b"HEAD" => Ok(Method::Head),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(Error::InvalidMethod),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    /// Whether a request with this method may carry a body.
    #[inline]
    pub const fn has_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,
    /// HTTP/1.1 - [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) fn parse(src: &str) -> Result<Self> {
        match src {
            "HTTP/1.1" => Ok(Self::Http11),
            "HTTP/1.0" => Ok(Self::Http10),
            _ => Err(Error::UnsupportedVersion),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

// STATUS_CODE

/// HTTP status: a numeric code and its reason phrase.
///
/// Common statuses are available as associated constants
/// ([`StatusCode::OK`], [`StatusCode::NOT_FOUND`], ...). Anything else can be
/// built with [`StatusCode::new`] or [`StatusCode::from_code`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusCode {
    code: u16,
    reason: Cow<'static, str>,
}

macro_rules! set_status_codes {
    ($(
        $name:ident = ($num:literal, $str:literal);
    )+) => {
        impl StatusCode { $(
            #[doc = concat!("`", stringify!($num), " ", $str, "`")]
            pub const $name: StatusCode = StatusCode {
                code: $num,
                reason: Cow::Borrowed($str),
            };
        )+

            /// Reason phrase registered for `code`, if it is in the catalog.
            pub const fn canonical_reason(code: u16) -> Option<&'static str> {
                match code {
                    $( $num => Some($str), )+
                    _ => None,
                }
            }
        }
    }
}

set_status_codes! {
    CONTINUE = (100, "Continue");
    SWITCHING_PROTOCOLS = (101, "Switching Protocols");

    OK = (200, "OK");
    CREATED = (201, "Created");
    ACCEPTED = (202, "Accepted");
    NO_CONTENT = (204, "No Content");
    PARTIAL_CONTENT = (206, "Partial Content");

    MOVED_PERMANENTLY = (301, "Moved Permanently");
    FOUND = (302, "Found");
    SEE_OTHER = (303, "See Other");
    NOT_MODIFIED = (304, "Not Modified");
    TEMPORARY_REDIRECT = (307, "Temporary Redirect");
    PERMANENT_REDIRECT = (308, "Permanent Redirect");

    BAD_REQUEST = (400, "Bad Request");
    UNAUTHORIZED = (401, "Unauthorized");
    FORBIDDEN = (403, "Forbidden");
    NOT_FOUND = (404, "Not Found");
    METHOD_NOT_ALLOWED = (405, "Method Not Allowed");
    REQUEST_TIMEOUT = (408, "Request Timeout");
    CONFLICT = (409, "Conflict");
    LENGTH_REQUIRED = (411, "Length Required");
    PAYLOAD_TOO_LARGE = (413, "Payload Too Large");
    URI_TOO_LONG = (414, "URI Too Long");
    UNSUPPORTED_MEDIA_TYPE = (415, "Unsupported Media Type");
    RANGE_NOT_SATISFIABLE = (416, "Range Not Satisfiable");
    EXPECTATION_FAILED = (417, "Expectation Failed");
    IM_A_TEAPOT = (418, "I'm a teapot");
    UNPROCESSABLE_ENTITY = (422, "Unprocessable Entity");
    UPGRADE_REQUIRED = (426, "Upgrade Required");
    TOO_MANY_REQUESTS = (429, "Too Many Requests");
    REQUEST_HEADER_FIELDS_TOO_LARGE = (431, "Request Header Fields Too Large");

    INTERNAL_SERVER_ERROR = (500, "Internal Server Error");
    NOT_IMPLEMENTED = (501, "Not Implemented");
    BAD_GATEWAY = (502, "Bad Gateway");
    SERVICE_UNAVAILABLE = (503, "Service Unavailable");
    GATEWAY_TIMEOUT = (504, "Gateway Timeout");
    HTTP_VERSION_NOT_SUPPORTED = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    /// Builds a status with an arbitrary code and reason phrase.
    ///
    /// ```
    /// use kiln::StatusCode;
    ///
    /// let status = StatusCode::new(299, "Custom Thing");
    /// assert_eq!(status.code(), 299);
    /// assert_eq!(status.reason(), "Custom Thing");
    /// ```
    pub fn new(code: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Builds a status from its code, using the catalog reason phrase when
    /// one exists.
    pub fn from_code(code: u16) -> Self {
        Self {
            code,
            reason: Cow::Borrowed(Self::canonical_reason(code).unwrap_or("Unknown")),
        }
    }

    #[inline(always)]
    pub const fn code(&self) -> u16 {
        self.code
    }

    #[inline(always)]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// `false` for statuses that never carry a body (1xx, 204, 304).
    #[inline]
    pub const fn allows_body(&self) -> bool {
        !matches!(self.code, 100..=199 | 204 | 304)
    }

    /// Appends `HTTP/1.1 200 OK\r\n` to `buf`.
    #[inline]
    pub(crate) fn write_first_line(&self, version: Version, buf: &mut Vec<u8>) {
        buf.extend_from_slice(version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.code.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_case_normalized() {
        #[rustfmt::skip]
        let cases = [
            ("GET",     Ok(Method::Get)),
            ("get",     Ok(Method::Get)),
            ("pOsT",    Ok(Method::Post)),
            ("put",     Ok(Method::Put)),
            ("Delete",  Ok(Method::Delete)),
            ("patch",   Ok(Method::Patch)),
            ("HEAD",    Ok(Method::Head)),
            ("options", Ok(Method::Options)),
            ("TRACE",   Err(())),
            ("CONNECT", Err(())),
            ("",        Err(())),
            ("GETTING", Err(())),
            ("OPTIONSS", Err(())),
        ];

        for (token, expected) in cases {
            assert_eq!(Method::parse(token).map_err(|_| ()), expected, "{token:?}");
        }
    }

    #[test]
    fn upper_table_is_ascii_only() {
        assert_eq!(ASCII_UPPER[b'a' as usize], b'A');
        assert_eq!(ASCII_UPPER[b'z' as usize], b'Z');
        assert_eq!(ASCII_UPPER[b'A' as usize], b'A');
        assert_eq!(ASCII_UPPER[0xE9], 0xE9);
        assert_eq!(lower_ascii("Content-Type"), "content-type");
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_decimal(b"0"), Some(0));
        assert_eq!(parse_decimal(b"1234"), Some(1234));
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"12a"), None);
        assert_eq!(parse_decimal(b"99999999999999999999999"), None);

        assert_eq!(parse_hex(b"1A"), Some(26));
        assert_eq!(parse_hex(b"ff"), Some(255));
        assert_eq!(parse_hex(b"0"), Some(0));
        assert_eq!(parse_hex(b"xyz"), None);
        assert_eq!(parse_hex(b"11111111111111111"), None);
    }

    #[test]
    fn status_codes() {
        assert_eq!(StatusCode::OK.code(), 200);
        assert_eq!(StatusCode::from_code(404), StatusCode::NOT_FOUND);
        assert_eq!(StatusCode::from_code(299).reason(), "Unknown");
        assert!(!StatusCode::NO_CONTENT.allows_body());
        assert!(!StatusCode::SWITCHING_PROTOCOLS.allows_body());
        assert!(StatusCode::OK.allows_body());

        let mut buf = Vec::new();
        StatusCode::new(299, "Custom").write_first_line(Version::Http10, &mut buf);
        assert_eq!(buf, b"HTTP/1.0 299 Custom\r\n");
    }
}
