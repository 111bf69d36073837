//! Fluent HTTP response builder.

use crate::{
    http::{
        cookie::Cookie,
        request::{ByteRange, Upgrade},
        types::StatusCode,
    },
    ws::{DynWebSocketHandler, WebSocketHandler},
};
use serde::Serialize;
use std::{fmt, path::PathBuf, sync::Arc};

pub use write::{BodyWriter, WriteBuffer};

/// HTTP response builder.
///
/// Build responses by chaining methods in strict order:
/// [`status()`](Response::status) (or [`redirect()`](Response::redirect)) ->
/// headers -> exactly one body method. Body methods return [`Handled`], the
/// proof a handler has to give back to the server.
///
/// Instances are created by the server and passed to
/// [`Handler::handle`](crate::Handler::handle) and the
/// [gate](crate::RequestGate) callbacks. The response is written once, after
/// the handler returns. The writer adds the headers the handler did not set
/// itself:
/// - `content-length`: size of the body or of the selected file range
/// - `connection: close`
/// - `date`
/// - `server`: [`RespLimits::server_name`](crate::limits::RespLimits::server_name)
///
/// # Examples
/// ```
/// use kiln::{Handled, Request, Response, StatusCode};
///
/// async fn handle(_req: &Request, resp: &mut Response) -> Handled {
///     resp.status(StatusCode::OK)
///         .header("content-type", "text/html")
///         .body("<h1>Hello World</h1>")
/// }
/// ```
///
/// # Panics
/// All methods perform order checks in `debug` mode that panic on violations.
/// In `release` mode these checks are omitted.
pub struct Response {
    status: StatusCode,
    headers: Vec<u8>,
    body: ResponseBody,
    present: PresentHeaders,
    state: ResponseState,
    websocket: Option<Arc<dyn DynWebSocketHandler>>,
}

/// Returned by every finalizing [`Response`] method.
#[derive(Debug)]
pub struct Handled(());

/// Payload of a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) enum ResponseBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    File {
        path: PathBuf,
        range: Option<ByteRange>,
    },
}

/// Headers the writer would otherwise add itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PresentHeaders {
    pub(crate) content_length: bool,
    pub(crate) content_type: bool,
    pub(crate) connection: bool,
    pub(crate) date: bool,
    pub(crate) server: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResponseState {
    Clean,
    Headers,
    Complete,
}

impl Response {
    #[inline(always)]
    pub(crate) fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::with_capacity(256),
            body: ResponseBody::Empty,
            present: PresentHeaders::default(),
            state: ResponseState::Clean,
            websocket: None,
        }
    }

    #[inline(always)]
    pub(crate) fn is_complete(&self) -> bool {
        self.state == ResponseState::Complete
    }

    #[inline(always)]
    pub(crate) fn raw_headers(&self) -> &[u8] {
        &self.headers
    }

    #[inline(always)]
    pub(crate) fn present(&self) -> PresentHeaders {
        self.present
    }

    #[inline(always)]
    pub(crate) fn body_ref(&self) -> &ResponseBody {
        &self.body
    }

    #[inline]
    pub(crate) fn take_websocket(&mut self) -> Option<Arc<dyn DynWebSocketHandler>> {
        self.websocket.take()
    }

    /// Status set by the handler.
    #[inline(always)]
    pub fn status_code(&self) -> &StatusCode {
        &self.status
    }
}

impl Response {
    /// Sets the HTTP status code for the response.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    ///
    /// resp.status(StatusCode::NOT_FOUND)
    ///     .body(r#"{"status": "not found", "code": 404}"#)
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be first and called only once`
    ///
    /// Panics in `debug` mode when:
    /// - Called multiple times
    /// - Called after any body method
    #[inline]
    #[track_caller]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Clean,
            "Must be first and called only once"
        );

        self.status = status;
        self.state = ResponseState::Headers;
        self
    }

    /// Sets a redirect status and the `location` header.
    ///
    /// Continue with more headers (cookies, for instance) and finish with
    /// [`empty()`](Response::empty) or any other body method.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::{Cookie, StatusCode};
    ///
    /// resp.redirect(StatusCode::SEE_OTHER, "/dashboard")
    ///     .cookie(&Cookie::new("session", "abc").path("/"))
    ///     .empty()
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be first and called only once`
    #[inline]
    #[track_caller]
    pub fn redirect<L: WriteBuffer>(&mut self, status: StatusCode, location: L) -> &mut Self {
        self.status(status).header("location", location)
    }

    /// Adds a header to the response. Duplicates are allowed and sent in
    /// the order they were added.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    ///
    /// resp.status(StatusCode::OK)
    ///     .header("content-type", "text/plain")        // &str, &str
    ///     .header("x-custom-id", 128)                  // &str, i32
    ///     .header("x-cache-enabled", true)             // &str, bool
    ///     .body("Done")
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and before any body method`
    ///
    /// Panics in `debug` mode when:
    /// - Called before [`status()`](Response::status)
    /// - Called after any body method
    #[inline]
    #[track_caller]
    pub fn header<N: WriteBuffer, V: WriteBuffer>(&mut self, name: N, value: V) -> &mut Self {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before any body method"
        );

        self.write_name(name);
        value.write_to(&mut self.headers);
        self.headers.extend_from_slice(b"\r\n");
        self
    }

    /// Adds a multi-value header to the response.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    ///
    /// resp.status(StatusCode::OK)
    ///     .header_multi("allow", ", ", ["GET", "POST"])
    ///     // allow: GET, POST
    ///     .header_multi("x-ids", ", ", vec![123, 234, 345])
    ///     // x-ids: 123, 234, 345
    ///     .body("Done")
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and before any body method`
    #[inline]
    #[track_caller]
    pub fn header_multi<N, S, I, V>(&mut self, name: N, split: S, values: I) -> &mut Self
    where
        N: WriteBuffer,
        S: WriteBuffer,
        I: IntoIterator<Item = V>,
        V: WriteBuffer,
    {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before any body method"
        );

        self.write_name(name);

        let mut iter = values.into_iter();
        if let Some(first) = iter.next() {
            first.write_to(&mut self.headers);

            for value in iter {
                split.write_to(&mut self.headers);
                value.write_to(&mut self.headers);
            }
        }

        self.headers.extend_from_slice(b"\r\n");
        self
    }

    /// Adds a header with parameters to the response.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    ///
    /// resp.status(StatusCode::OK)
    ///     .header_params("content-type", "; ", [
    ///         ("text/html", None),
    ///         ("charset", Some("utf-8")),
    ///     ])
    ///     // content-type: text/html; charset=utf-8
    ///     .body("Done")
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and before any body method`
    #[inline]
    #[track_caller]
    pub fn header_params<N, S, I, K, V>(&mut self, name: N, split: S, params: I) -> &mut Self
    where
        N: WriteBuffer,
        S: WriteBuffer,
        I: IntoIterator<Item = (K, Option<V>)>,
        K: WriteBuffer,
        V: WriteBuffer,
    {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and before any body method"
        );

        self.write_name(name);

        for (index, (key, value)) in params.into_iter().enumerate() {
            if index > 0 {
                split.write_to(&mut self.headers);
            }
            key.write_to(&mut self.headers);
            if let Some(value) = value {
                self.headers.push(b'=');
                value.write_to(&mut self.headers);
            }
        }

        self.headers.extend_from_slice(b"\r\n");
        self
    }

    /// Adds a `set-cookie` header.
    ///
    /// # Panics
    /// Error message: `Must be called after status() and before any body method`
    #[inline]
    #[track_caller]
    pub fn cookie(&mut self, cookie: &Cookie) -> &mut Self {
        self.header("set-cookie", cookie)
    }

    /// Sets the response body and finalizes the response.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    ///
    /// resp.status(StatusCode::OK)
    ///     .header("content-type", "text/plain")
    ///     .body("Hello, World!")
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and any header methods`
    #[inline]
    #[track_caller]
    pub fn body<T: WriteBuffer>(&mut self, data: T) -> Handled {
        self.body_with(|writer| writer.write(data))
    }

    /// Writes the response body via closure and finalizes the response.
    ///
    /// # Examples
    /// Using [`write!`]:
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    /// use std::io::Write;
    ///
    /// resp.status(StatusCode::OK)
    ///     .header("content-type", "application/json")
    ///     .body_with(|writer| {
    ///         let _ = write!(writer, r#"{{"status": "ok", "count": {}}}"#, 3);
    ///     })
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and any header methods`
    #[inline]
    #[track_caller]
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> Handled {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        let mut data = Vec::new();
        f(&mut BodyWriter(&mut data));
        self.finish(ResponseBody::Bytes(data))
    }

    /// Serializes `value` as the JSON body and sets `content-type:
    /// application/json` unless a content type was already given.
    ///
    /// If serialization fails the response becomes an empty
    /// `500 Internal Server Error`.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    /// use serde::Serialize;
    ///
    /// #[derive(Serialize)]
    /// struct User { id: u32, name: &'static str }
    ///
    /// resp.status(StatusCode::OK).json(&User { id: 1, name: "ann" })
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and any header methods`
    #[track_caller]
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Handled {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        match serde_json::to_vec(value) {
            Ok(data) => {
                if !self.present.content_type {
                    self.header("content-type", "application/json");
                }
                self.finish(ResponseBody::Bytes(data))
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize JSON response body");

                self.status = StatusCode::INTERNAL_SERVER_ERROR;
                self.headers.clear();
                self.present = PresentHeaders::default();
                self.finish(ResponseBody::Empty)
            }
        }
    }

    /// Finalizes the response without a body.
    ///
    /// # Panics
    /// Error message: `Must be called after status() and any header methods`
    #[inline]
    #[track_caller]
    pub fn empty(&mut self) -> Handled {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        self.finish(ResponseBody::Empty)
    }

    /// Streams a file as the body.
    ///
    /// The file is opened when the response is written; a missing file
    /// turns the response into `404 Not Found`.
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|req, resp| {
    /// use kiln::StatusCode;
    ///
    /// match req.range() {
    ///     Some(range) => resp
    ///         .status(StatusCode::PARTIAL_CONTENT)
    ///         .file_range("static/video.mp4", range),
    ///     None => resp
    ///         .status(StatusCode::OK)
    ///         .header("content-type", "video/mp4")
    ///         .file("static/video.mp4"),
    /// }
    /// # });
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be called after status() and any header methods`
    #[inline]
    #[track_caller]
    pub fn file(&mut self, path: impl Into<PathBuf>) -> Handled {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        self.finish(ResponseBody::File {
            path: path.into(),
            range: None,
        })
    }

    /// Streams part of a file as the body, with `content-range`.
    ///
    /// A `200 OK` status is sent as `206 Partial Content`. A range that lies
    /// outside the file turns the response into `416 Range Not Satisfiable`.
    ///
    /// # Panics
    /// Error message: `Must be called after status() and any header methods`
    #[inline]
    #[track_caller]
    pub fn file_range(&mut self, path: impl Into<PathBuf>, range: ByteRange) -> Handled {
        debug_assert!(
            self.state == ResponseState::Headers,
            "Must be called after status() and any header methods"
        );

        self.finish(ResponseBody::File {
            path: path.into(),
            range: Some(range),
        })
    }

    /// Accepts a WebSocket upgrade and hands the connection to `handler`.
    ///
    /// Sends `101 Switching Protocols` with `Sec-WebSocket-Accept` and, when
    /// [`WebSocketHandler::select_protocol`] picks one, `Sec-WebSocket-Protocol`.
    /// Once the response is written the server runs the WebSocket loop on its
    /// own task.
    ///
    /// # Examples
    /// ```
    /// use kiln::{Handled, Request, Response, StatusCode, WebSocketHandler};
    ///
    /// struct Echo;
    /// impl WebSocketHandler for Echo {}
    ///
    /// async fn handle(req: &Request, resp: &mut Response) -> Handled {
    ///     match req.upgrade() {
    ///         Some(upgrade) => resp.websocket(upgrade, Echo),
    ///         None => resp.status(StatusCode::UPGRADE_REQUIRED).empty(),
    ///     }
    /// }
    /// ```
    ///
    /// # Panics
    /// Error message: `Must be first and called only once`
    #[inline]
    #[track_caller]
    pub fn websocket<H: WebSocketHandler>(&mut self, upgrade: &Upgrade, handler: H) -> Handled {
        self.websocket_shared(upgrade, Arc::new(handler))
    }

    #[track_caller]
    pub(crate) fn websocket_shared(
        &mut self,
        upgrade: &Upgrade,
        handler: Arc<dyn DynWebSocketHandler>,
    ) -> Handled {
        self.status(StatusCode::SWITCHING_PROTOCOLS)
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-accept", upgrade.accept_key());

        if let Some(protocol) = handler.select_protocol(upgrade.protocols()) {
            self.header("sec-websocket-protocol", protocol);
        }

        self.websocket = Some(handler);
        self.finish(ResponseBody::Empty)
    }
}

impl Response {
    #[inline(always)]
    fn write_name<N: WriteBuffer>(&mut self, name: N) {
        let start = self.headers.len();
        name.write_to(&mut self.headers);

        let name = &self.headers[start..];
        let present = &mut self.present;
        match name.len() {
            4 if name.eq_ignore_ascii_case(b"date") => present.date = true,
            6 if name.eq_ignore_ascii_case(b"server") => present.server = true,
            10 if name.eq_ignore_ascii_case(b"connection") => present.connection = true,
            12 if name.eq_ignore_ascii_case(b"content-type") => present.content_type = true,
            14 if name.eq_ignore_ascii_case(b"content-length") => present.content_length = true,
            _ => {}
        }

        self.headers.extend_from_slice(b": ");
    }

    #[inline(always)]
    fn finish(&mut self, body: ResponseBody) -> Handled {
        self.body = body;
        self.state = ResponseState::Complete;
        Handled(())
    }

    #[inline]
    const fn number_to_bytes(mut n: u128) -> ([u8; 39], usize) {
        let mut buffer = [b'0'; 39];
        let mut i = 39;

        if n == 0 {
            return (buffer, 38);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &String::from_utf8_lossy(&self.headers))
            .field("body", &self.body)
            .field("state", &self.state)
            .field("websocket", &self.websocket.is_some())
            .finish()
    }
}

pub mod write {
    use super::*;
    use std::{borrow::Cow, rc::Rc};

    /// Writer for constructing the HTTP response body.
    /// Used in [body_with](Response::body_with).
    ///
    /// # Examples
    /// ```
    /// # kiln::run_test(|_, resp| {
    /// use kiln::StatusCode;
    /// use std::io::Write;
    ///
    /// resp.status(StatusCode::OK)
    ///     .body_with(|w| {
    ///         w.write("<ul>");
    ///         for i in 0..3 {
    ///             let _ = write!(w, "<li>{i}</li>");
    ///         }
    ///         w.write("</ul>");
    ///     })
    /// # });
    /// ```
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends content to the response body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Trait for writing header values and bodies into a [`Response`].
    ///
    /// Implemented for strings, bytes, booleans, characters and integer
    /// types. Floating-point numbers are left out to keep header formatting
    /// locale- and precision-independent.
    ///
    /// # Example
    /// ```
    /// use kiln::WriteBuffer;
    ///
    /// struct Etag(u64);
    ///
    /// impl WriteBuffer for Etag {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         buffer.extend_from_slice(format!("\"{:x}\"", self.0).as_bytes())
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        /// Writes the value's representation directly to the buffer.
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (bytes, $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let closure = $conn;
                    closure(self, buffer);
                }
            })*
        };
        (number($type:ty), $conn:expr => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    $conn(*self as $type, buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }
    impl_write_buffer! {
        bytes, |value: &str, buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value.as_bytes());
        } => str, String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>
    }
    impl_write_buffer! {
        bytes, |value: &[u8], buffer: &mut Vec<u8>| {
            buffer.extend_from_slice(value);
        } => [u8], Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>
    }
    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }
    impl_write_buffer! {
        number(u128), write_unsigned => u8, u16, u32, u64, u128, usize
    }
    impl_write_buffer! {
        number(i128), write_signed => i8, i16, i32, i64, i128, isize
    }
    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }
    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    #[inline(always)]
    pub(crate) fn write_unsigned(value: u128, buffer: &mut Vec<u8>) {
        let (arr, start) = Response::number_to_bytes(value);
        buffer.extend_from_slice(&arr[start..]);
    }

    #[inline(always)]
    fn write_signed(value: i128, buffer: &mut Vec<u8>) {
        if value < 0 {
            buffer.push(b'-');
        }
        write_unsigned(value.unsigned_abs(), buffer);
    }
}


#[cfg(test)]
mod header_tests {
    use super::*;

    macro_rules! test_header {
        ($method:ident, $(($name:expr $(, $params:expr)*; $result:expr);)*) => {
           #[test] fn $method() {$(
            let mut resp = Response::new();
            resp.status(StatusCode::OK);

            resp.$method($name $(, $params)*);
            assert_eq!(String::from_utf8_lossy(&resp.headers), $result);
            assert_eq!(resp.state, ResponseState::Headers);
        )*}};
    }

    test_header! {header,
        ("name", "value"; "name: value\r\n");
        ("name", ""; "name: \r\n");
        ("name", 123; "name: 123\r\n");
        ("name", vec![35, 33, 43]; "name: #!+\r\n");
        ("name", false; "name: false\r\n");
        ("name", -123; "name: -123\r\n");
        ("name", 'x'; "name: x\r\n");
        ("name", String::from("owned"); "name: owned\r\n");
    }

    test_header! {header_multi,
        ("allow", ", ", ["GET", "HEAD"]; "allow: GET, HEAD\r\n");
        ("x-ids", ",", vec![1, 2, 3]; "x-ids: 1,2,3\r\n");
        ("x-empty", ",", Vec::<&str>::new(); "x-empty: \r\n");
    }

    test_header! {header_params,
        ("content-type", "; ", [("text/html", None), ("charset", Some("utf-8"))];
            "content-type: text/html; charset=utf-8\r\n");
        ("cache-control", ", ", [("max-age", Some(60)), ("public", None)];
            "cache-control: max-age=60, public\r\n");
    }

    #[test]
    fn tracks_generated_headers() {
        #[rustfmt::skip]
        let cases = [
            ("Content-Length", PresentHeaders { content_length: true, ..Default::default() }),
            ("CONNECTION",     PresentHeaders { connection: true, ..Default::default() }),
            ("date",           PresentHeaders { date: true, ..Default::default() }),
            ("Server",         PresentHeaders { server: true, ..Default::default() }),
            ("content-type",   PresentHeaders { content_type: true, ..Default::default() }),
            ("x-server",       PresentHeaders::default()),
        ];

        for (name, expected) in cases {
            let mut resp = Response::new();
            resp.status(StatusCode::OK).header(name, "1");
            assert_eq!(resp.present(), expected, "{name}");
        }
    }

    #[test]
    fn cookies_and_redirect() {
        let mut resp = Response::new();
        resp.redirect(StatusCode::FOUND, "/login")
            .cookie(&Cookie::removal("sid"))
            .empty();

        assert_eq!(resp.status_code(), &StatusCode::FOUND);
        assert_eq!(
            String::from_utf8_lossy(&resp.headers),
            "location: /login\r\nset-cookie: sid=; Path=/; Max-Age=0\r\n"
        );
        assert_eq!(resp.body, ResponseBody::Empty);
    }

    #[test]
    #[should_panic(expected = "Must be called after status() and before any body method")]
    fn header_before_status() {
        Response::new().header("Name", "value");
    }

    #[test]
    #[should_panic(expected = "Must be called after status() and before any body method")]
    fn header_after_body() {
        let mut resp = Response::new();
        resp.status(StatusCode::OK).body("");
        resp.header("Name", "value");
    }
}
