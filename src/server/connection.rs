use crate::{
    errors::Result,
    http::{
        body::{Body, Framing},
        head::RequestHead,
        reader::BufferedReader,
        request::{Request, Upgrade},
        response::Response,
        types::{StatusCode, Version},
        writer,
    },
    server::server_impl::{RequestGate, Shared},
    ws::{connection::Socket, DynWebSocketHandler, WebSocketConnection},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A request whose response switched protocols.
struct Upgraded {
    request: Request,
    handler: Arc<dyn DynWebSocketHandler>,
}

/// Serves one request on `stream`, then closes it or hands it to a
/// WebSocket task.
pub(crate) async fn serve<S: Socket>(shared: &Arc<Shared>, stream: S, peer: Option<SocketAddr>) {
    let limits = &shared.limits;
    let stream: Box<dyn Socket> = Box::new(stream);
    let mut reader = BufferedReader::with_chunk(stream, limits.req.read_chunk);
    reader.set_timeout(Some(limits.conn.socket_read_timeout));

    let mut version = Version::Http11;
    match process(shared, &mut reader, peer, &mut version).await {
        Ok(Some(upgraded)) => {
            reader.set_timeout(None);
            spawn_websocket(shared, reader, peer, upgraded);
            return;
        }
        Ok(None) => {}
        Err(err) if err.is_silent() => {
            debug!(peer = ?peer, error = %err, "connection dropped");
        }
        Err(err) => {
            warn!(peer = ?peer, error = %err, status = err.status().code(), "request rejected");

            let response = err.to_http(version, limits.server.json_errors);
            let _ = writer::write_bytes(
                reader.get_mut(),
                &response,
                limits.conn.socket_write_timeout,
            )
            .await;
        }
    }

    let _ = reader.get_mut().shutdown().await;
}

/// Runs one request through the state machine:
/// head -> gates -> body (or upgrade) -> handler -> response.
async fn process(
    shared: &Shared,
    reader: &mut BufferedReader<Box<dyn Socket>>,
    peer: Option<SocketAddr>,
    version: &mut Version,
) -> Result<Option<Upgraded>> {
    let limits = &shared.limits;
    let write_timeout = limits.conn.socket_write_timeout;

    let head = RequestHead::read(reader, &limits.req).await?;
    *version = head.version();
    let method = head.method();

    let mut resp = Response::new();
    if check_gates(&*shared.gate, &head, &mut resp).is_err() {
        debug!(method = %method, path = head.path(), status = resp.status_code().code(), "rejected by gate");
        writer::write_response(reader.get_mut(), &resp, method, *version, &limits.resp, write_timeout)
            .await?;
        return Ok(None);
    }

    let body = match Upgrade::detect(&head) {
        Some(_) => Body::None,
        None => {
            let framing = Framing::of(&head)?;
            if head.expects_continue() && framing.expects_data() && *version == Version::Http11 {
                writer::write_bytes(reader.get_mut(), CONTINUE, write_timeout).await?;
            }
            Body::read(reader, &head, &limits.req).await?
        }
    };

    let request = Request::new(head, body, peer, limits.multipart.clone());
    shared.router.dispatch(&request, &mut resp).await;

    let websocket = resp.take_websocket();
    if resp.status_code() == &StatusCode::SWITCHING_PROTOCOLS && websocket.is_none() {
        warn!(method = %method, path = request.path(), "101 response without a websocket handler");
        resp = Response::new();
        resp.status(StatusCode::INTERNAL_SERVER_ERROR).empty();
    }

    let status = writer::write_response(
        reader.get_mut(),
        &resp,
        method,
        *version,
        &limits.resp,
        write_timeout,
    )
    .await?;
    debug!(method = %method, path = request.path(), status = status.code(), "request completed");

    match (status.code(), websocket) {
        (101, Some(handler)) => Ok(Some(Upgraded { request, handler })),
        _ => Ok(None),
    }
}

#[inline]
fn check_gates(
    gate: &dyn RequestGate,
    head: &RequestHead,
    resp: &mut Response,
) -> Result<(), crate::Handled> {
    gate.on_request_head(head, resp)?;
    gate.on_before_body(head, resp)
}

fn spawn_websocket(
    shared: &Shared,
    reader: BufferedReader<Box<dyn Socket>>,
    peer: Option<SocketAddr>,
    upgraded: Upgraded,
) {
    let mut conn = WebSocketConnection::from_reader(
        reader,
        shared.limits.ws.clone(),
        Some(shared.limits.conn.socket_write_timeout),
        peer,
    );

    tokio::spawn(async move {
        let Upgraded { request, handler } = upgraded;
        handler.on_open(&mut conn, &request).await;
        drop(request);

        match conn.run_dyn(&*handler).await {
            Ok(()) => debug!(peer = ?peer, "websocket closed"),
            Err(err) if err.is_silent() => debug!(peer = ?peer, error = %err, "websocket dropped"),
            Err(err) => warn!(peer = ?peer, error = %err, "websocket loop failed"),
        }
        conn.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::response::Handled,
        limits::{ConnLimits, Limits, ReqLimits},
        server::router::Router,
        ws::frame::{Frame, Opcode},
        Handler, WebSocketHandler,
    };
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Upload;

    impl Handler for Upload {
        async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
            let size = req.body().len();
            resp.status(StatusCode::OK)
                .body(format!("{} {} {size}", req.method(), req.path()))
        }
    }

    struct Echo;

    impl WebSocketHandler for Echo {
        async fn on_open(&self, conn: &mut WebSocketConnection, req: &Request) {
            let _ = conn.send_text(&format!("welcome to {}", req.path())).await;
        }

        async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
            match frame.opcode {
                Opcode::Text | Opcode::Binary => Some(vec![Frame::new(frame.opcode, frame.payload)]),
                _ => None,
            }
        }
    }

    struct Large;

    impl Handler for Large {
        async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
            resp.status(StatusCode::OK).body(vec![b'x'; 256 * 1024])
        }
    }

    /// Answers an upgrade by hand, without a websocket handler.
    struct BareSwitch;

    impl Handler for BareSwitch {
        async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
            resp.status(StatusCode::SWITCHING_PROTOCOLS)
                .header("upgrade", "websocket")
                .header("connection", "upgrade")
                .empty()
        }
    }

    struct Gate {
        reject_path: &'static str,
        max_body: u64,
    }

    impl RequestGate for Gate {
        fn on_request_head(&self, head: &RequestHead, resp: &mut Response) -> Result<(), Handled> {
            match head.path() == self.reject_path {
                true => Err(resp.status(StatusCode::FORBIDDEN).body("no")),
                false => Ok(()),
            }
        }

        fn on_before_body(&self, head: &RequestHead, resp: &mut Response) -> Result<(), Handled> {
            match head.content_length().unwrap_or(0) > self.max_body {
                true => Err(resp.status(StatusCode::PAYLOAD_TOO_LARGE).empty()),
                false => Ok(()),
            }
        }
    }

    fn shared(gate: impl RequestGate, limits: Limits) -> Arc<Shared> {
        Arc::new(Shared {
            router: Router::builder()
                .route("/upload", Upload)
                .route("/switch", BareSwitch)
                .route("/large", Large)
                .websocket("/ws", Echo)
                .build(),
            gate: Box::new(gate),
            limits,
        })
    }

    fn open_gate() -> Gate {
        Gate {
            reject_path: "/forbidden",
            max_body: 1024,
        }
    }

    async fn exchange(shared: &Arc<Shared>, raw: &[u8]) -> String {
        let (mut client, server) = duplex(1 << 16);
        let serve = tokio::spawn({
            let shared = shared.clone();
            async move { serve(&shared, server, None).await }
        });

        client.write_all(raw).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        serve.await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn plain_request() {
        let shared = shared((), Limits::default());

        #[rustfmt::skip]
        let cases = [
            ("POST /upload HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",                 "HTTP/1.1 200 OK",        "POST /upload 5"),
            ("PUT /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n", "HTTP/1.1 200 OK", "PUT /upload 3"),
            ("GET /upload?a=1 HTTP/1.0\r\n\r\n",                                         "HTTP/1.0 200 OK",        "GET /upload 0"),
            ("GET /nowhere HTTP/1.1\r\n\r\n",                                            "HTTP/1.1 404 Not Found", ""),
        ];

        for (raw, status_line, body) in cases {
            let text = exchange(&shared, raw.as_bytes()).await;
            assert!(text.starts_with(status_line), "{text}");
            assert!(text.contains("connection: close\r\n"), "{text}");
            assert!(text.ends_with(&format!("\r\n\r\n{body}")), "{text}");
        }
    }

    #[tokio::test]
    async fn errors_become_responses() {
        let limits = Limits {
            req: ReqLimits {
                body_size: 16,
                ..ReqLimits::default()
            },
            ..Limits::default()
        };
        let shared = shared((), limits);

        #[rustfmt::skip]
        let cases = [
            ("BREW /pot HTTP/1.1\r\n\r\n",                                         "HTTP/1.1 400 Bad Request",        "INVALID_METHOD"),
            ("GET / HTTP/1.1\r\nbroken header\r\n\r\n",                            "HTTP/1.1 400 Bad Request",        "INVALID_HEADER"),
            ("POST /upload HTTP/1.1\r\nContent-Length: 17\r\n\r\n",                "HTTP/1.1 413 Payload Too Large",  "BODY_TOO_LARGE"),
            ("POST /upload HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",           "HTTP/1.1 400 Bad Request",        "UNSUPPORTED"),
            ("POST /upload HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",  "HTTP/1.0 400 Bad Request",        "INVALID_CHUNK"),
        ];

        for (raw, status_line, code) in cases {
            let text = exchange(&shared, raw.as_bytes()).await;
            assert!(text.starts_with(status_line), "{text}");
            assert!(text.contains(code), "{text}");
        }

        // Peer gone before a full head: nothing is written
        assert_eq!(exchange(&shared, b"GET / HT").await, "");
    }

    #[tokio::test]
    async fn gates_run_before_body() {
        let shared = shared(open_gate(), Limits::default());

        let text = exchange(&shared, b"GET /forbidden HTTP/1.1\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\nno"));

        // The declared body is never sent; the gate answers without waiting for it
        let (mut client, server) = duplex(1 << 16);
        let task = tokio::spawn({
            let shared = shared.clone();
            async move { serve(&shared, server, None).await }
        });
        client
            .write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 1000000\r\n\r\n")
            .await
            .unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn expect_continue() {
        let shared = shared(open_gate(), Limits::default());
        let (mut client, server) = duplex(1 << 16);
        let task = tokio::spawn({
            let shared = shared.clone();
            async move { serve(&shared, server, None).await }
        });

        client
            .write_all(b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n")
            .await
            .unwrap();

        let mut interim = vec![0; CONTINUE.len()];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(interim, CONTINUE);

        client.write_all(b"data").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("POST /upload 4"));

        // A body the decoder will refuse is rejected without the interim response
        let text = exchange(
            &shared,
            b"POST /upload HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\nExpect: 100-continue\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert!(text.contains("UNSUPPORTED"), "{text}");

        // Nothing to wait for: no interim response either
        let text = exchange(
            &shared,
            b"POST /upload HTTP/1.1\r\nContent-Length: 0\r\nExpect: 100-continue\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    }

    async fn next_frame(reader: &mut BufferedReader<DuplexStream>) -> Frame {
        loop {
            if let Some((frame, used)) = Frame::parse(reader.buffered(), u64::MAX).unwrap() {
                reader.consume(used);
                return frame;
            }
            assert!(reader.fill().await.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn websocket_handoff() {
        let shared = shared((), Limits::default());
        let (mut client, server) = duplex(1 << 16);
        let serve = tokio::spawn({
            let shared = shared.clone();
            async move { serve(&shared, server, None).await }
        });

        // The first frame travels in the same packet as the handshake
        let mut raw = b"GET /ws HTTP/1.1\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
            .to_vec();
        raw.extend_from_slice(&Frame::text("early").encode_masked([1, 2, 3, 4]));
        client.write_all(&raw).await.unwrap();

        // The worker returns right after the handshake
        serve.await.unwrap();

        let mut reader = BufferedReader::new(client);
        let status = reader.read_line(1024).await.unwrap().to_vec();
        assert_eq!(status, b"HTTP/1.1 101 Switching Protocols");
        loop {
            let line = reader.read_line(1024).await.unwrap();
            if line.is_empty() {
                break;
            }
            assert!(!line.starts_with(b"content-length"));
        }

        assert_eq!(next_frame(&mut reader).await.as_text(), Some("welcome to /ws"));
        assert_eq!(next_frame(&mut reader).await.as_text(), Some("early"));

        let close = Frame::close(1000, "bye").encode_masked([9, 9, 9, 9]);
        reader.get_mut().write_all(&close).await.unwrap();
        let echoed = next_frame(&mut reader).await;
        assert_eq!(echoed.opcode, Opcode::Close);
        assert_eq!(echoed.close_code(), Some(1000));

        // The server closes its side after the handshake completes
        assert_eq!(reader.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn switching_without_handler() {
        let shared = shared((), Limits::default());
        let raw = b"GET /switch HTTP/1.1\r\n\
            Connection: Upgrade\r\n\
            Upgrade: websocket\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

        // The socket is closed after an error response instead of a dangling 101
        let text = exchange(&shared, raw).await;
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
        assert!(!text.contains("upgrade: websocket"), "{text}");
    }

    #[tokio::test]
    async fn stalled_response_is_not_followed_by_error() {
        let limits = Limits {
            conn: ConnLimits {
                socket_write_timeout: std::time::Duration::from_millis(50),
                ..ConnLimits::default()
            },
            ..Limits::default()
        };
        let shared = shared((), limits);
        let (mut client, server) = duplex(4096);

        client.write_all(b"GET /large HTTP/1.1\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();

        // Nobody reads until the worker has given up on the response
        serve(&shared, server, None).await;

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(!text.contains("HTTP/1.1 500"));
        assert!(out.len() < 256 * 1024);
    }
}
