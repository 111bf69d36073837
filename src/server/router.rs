//! Exact-path routing for HTTP and WebSocket handlers.

use crate::{
    http::{
        request::Request,
        response::{Handled, Response},
        types::StatusCode,
    },
    server::server_impl::{DynHandler, Handler},
    ws::{DynWebSocketHandler, WebSocketHandler},
};
use std::{collections::HashMap, fmt, sync::Arc};

/// Maps request paths to handlers.
///
/// Paths are compared exactly, without the query string. A request for a
/// path nobody registered goes to the fallback handler, or gets
/// `404 Not Found` when there is none.
///
/// WebSocket routes answer the handshake themselves: a plain request gets
/// `426 Upgrade Required`, as does an upgrade asking for a
/// `Sec-WebSocket-Version` other than 13.
///
/// # Examples
/// ```
/// use kiln::{Frame, Handled, Handler, Request, Response, Router, StatusCode};
/// use kiln::{WebSocketConnection, WebSocketHandler};
///
/// struct Index;
/// impl Handler for Index {
///     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::OK).body("index")
///     }
/// }
///
/// struct Echo;
/// impl WebSocketHandler for Echo {
///     async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
///         Some(vec![frame])
///     }
/// }
///
/// let router = Router::builder()
///     .route("/", Index)
///     .websocket("/ws", Echo)
///     .build();
/// ```
pub struct Router {
    routes: HashMap<String, Route>,
    fallback: Option<Arc<dyn DynHandler>>,
}

enum Route {
    Http(Arc<dyn DynHandler>),
    WebSocket(Arc<dyn DynWebSocketHandler>),
}

impl Router {
    #[inline]
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            routes: HashMap::new(),
            fallback: None,
        }
    }

    pub(crate) async fn dispatch(&self, req: &Request, resp: &mut Response) -> Handled {
        match self.routes.get(req.path()) {
            Some(Route::Http(handler)) => handler.handle_dyn(req, resp).await,
            Some(Route::WebSocket(handler)) => match req.upgrade() {
                Some(upgrade) if upgrade.is_supported_version() => {
                    resp.websocket_shared(upgrade, handler.clone())
                }
                _ => resp
                    .status(StatusCode::UPGRADE_REQUIRED)
                    .header("upgrade", "websocket")
                    .header("sec-websocket-version", "13")
                    .empty(),
            },
            None => match &self.fallback {
                Some(handler) => handler.handle_dyn(req, resp).await,
                None => resp.status(StatusCode::NOT_FOUND).empty(),
            },
        }
    }
}

impl Handler for Router {
    #[inline]
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        self.dispatch(req, resp).await
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.routes.keys().collect();
        paths.sort();

        f.debug_struct("Router")
            .field("routes", &paths)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Builder for [`Router`].
///
/// Registering the same path twice keeps the last handler.
pub struct RouterBuilder {
    routes: HashMap<String, Route>,
    fallback: Option<Arc<dyn DynHandler>>,
}

impl RouterBuilder {
    #[inline]
    pub fn route<H: Handler>(mut self, path: impl Into<String>, handler: H) -> Self {
        self.routes.insert(path.into(), Route::Http(Arc::new(handler)));
        self
    }

    #[inline]
    pub fn websocket<H: WebSocketHandler>(mut self, path: impl Into<String>, handler: H) -> Self {
        self.routes.insert(path.into(), Route::WebSocket(Arc::new(handler)));
        self
    }

    /// Handler for every path without a route.
    #[inline]
    pub fn fallback<H: Handler>(mut self, handler: H) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    #[inline]
    pub fn build(self) -> Router {
        Router {
            routes: self.routes,
            fallback: self.fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::{body::Body, head::RequestHead},
        limits::MultipartLimits,
        Frame, Method, Version, WebSocketConnection,
    };

    struct Text(&'static str);

    impl Handler for Text {
        async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
            resp.status(StatusCode::OK).body(self.0)
        }
    }

    struct Echo;

    impl WebSocketHandler for Echo {
        async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
            Some(vec![frame])
        }
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut head = RequestHead::new(Method::Get, uri.to_string(), Version::Http11);
        for (name, value) in headers {
            head.push_header(name, value);
        }
        Request::new(head, Body::None, None, MultipartLimits::default())
    }

    async fn route(router: &Router, req: &Request) -> Response {
        let mut resp = Response::new();
        router.dispatch(req, &mut resp).await;
        resp
    }

    const UPGRADE: [(&str, &str); 3] = [
        ("Connection", "Upgrade"),
        ("Upgrade", "websocket"),
        ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
    ];

    #[tokio::test]
    async fn http_routes() {
        let router = Router::builder()
            .route("/", Text("index"))
            .route("/about", Text("old"))
            .route("/about", Text("about"))
            .build();

        #[rustfmt::skip]
        let cases = [
            ("/",             200, Some("index")),
            ("/about?x=1",    200, Some("about")),
            ("/about/",       404, None),
            ("/missing",      404, None),
        ];

        for (uri, code, body) in cases {
            let resp = route(&router, &request(uri, &[])).await;
            assert_eq!(resp.status_code().code(), code, "{uri}");

            if let Some(body) = body {
                assert_eq!(
                    resp.body_ref(),
                    &crate::http::response::ResponseBody::Bytes(body.as_bytes().to_vec())
                );
            }
        }
    }

    #[tokio::test]
    async fn fallback() {
        let router = Router::builder()
            .route("/", Text("index"))
            .fallback(Text("anything"))
            .build();

        let resp = route(&router, &request("/x/y", &[])).await;
        assert_eq!(resp.status_code(), &StatusCode::OK);
    }

    #[tokio::test]
    async fn websocket_routes() {
        let router = Router::builder().websocket("/ws", Echo).build();

        let mut resp = route(&router, &request("/ws", &UPGRADE)).await;
        assert_eq!(resp.status_code(), &StatusCode::UPGRADE_REQUIRED, "no version");

        let mut headers = UPGRADE.to_vec();
        headers.push(("Sec-WebSocket-Version", "13"));
        resp = route(&router, &request("/ws", &headers)).await;
        assert_eq!(resp.status_code(), &StatusCode::SWITCHING_PROTOCOLS);
        assert!(String::from_utf8_lossy(resp.raw_headers())
            .contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(resp.take_websocket().is_some());

        headers.pop();
        headers.push(("Sec-WebSocket-Version", "8"));
        resp = route(&router, &request("/ws", &headers)).await;
        assert_eq!(resp.status_code(), &StatusCode::UPGRADE_REQUIRED);
        assert!(String::from_utf8_lossy(resp.raw_headers())
            .contains("sec-websocket-version: 13\r\n"));

        resp = route(&router, &request("/ws", &[])).await;
        assert_eq!(resp.status_code(), &StatusCode::UPGRADE_REQUIRED);
        assert!(resp.take_websocket().is_none());
    }
}
