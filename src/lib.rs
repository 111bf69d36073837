//! kiln - embeddable HTTP/1.1 and WebSocket server core
//!
//! A small server core for applications that render their own pages and
//! need uploads and live connections without a full web framework.
//!
//! # Request lifecycle
//!
//! Every accepted connection carries exactly one request:
//!
//! 1. The head is parsed ([`RequestHead`]).
//! 2. The [`RequestGate`] may reject it, twice: after the head and right
//!    before the body is read.
//! 3. The body is decoded ([`Body`]): fixed length or chunked, spilled to a
//!    temporary file above a threshold. WebSocket upgrade requests skip this.
//! 4. The [`Router`] runs the matching [`Handler`], which fills a
//!    [`Response`].
//! 5. The response is written and the connection is closed, unless it was
//!    answered with `101 Switching Protocols`: the socket then moves to its
//!    own task running the [`WebSocketHandler`].
//!
//! # Protocol Support
//!
//! - **HTTP/1.1** and **HTTP/1.0**, `Connection: close` after each response
//! - **Chunked** request bodies, with trailers
//! - **multipart/form-data** decoded by streaming file parts to disk
//! - **WebSocket** (RFC 6455, version 13) with fragmentation, ping/pong and
//!   the closing handshake
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use kiln::{Handled, Handler, Request, Response, Router, Server, StatusCode};
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
//!         let name = req.query("name").unwrap_or("world");
//!         resp.status(StatusCode::OK).body(format!("Hello, {name}!"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .bind("127.0.0.1", 8080)
//!         .unwrap()
//!         .router(Router::builder().route("/", Hello).build())
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//! Uploads and a WebSocket chat:
//! ```no_run
//! use kiln::{Frame, Handled, Handler, Opcode, Request, Response, Router, Server, StatusCode};
//! use kiln::{WebSocketConnection, WebSocketHandler};
//!
//! struct Upload;
//!
//! impl Handler for Upload {
//!     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
//!         let form = match req.multipart().await {
//!             Ok(form) => form,
//!             Err(err) => return resp.status(err.status()).body(err.to_string()),
//!         };
//!
//!         for (index, file) in form.into_files().into_iter().enumerate() {
//!             if file.persist(format!("uploads/{index}.bin")).await.is_err() {
//!                 return resp.status(StatusCode::INTERNAL_SERVER_ERROR).empty();
//!             }
//!         }
//!         resp.status(StatusCode::SEE_OTHER).header("location", "/").empty()
//!     }
//! }
//!
//! struct Chat;
//!
//! impl WebSocketHandler for Chat {
//!     async fn on_frame(&self, _: &mut WebSocketConnection, frame: Frame) -> Option<Vec<Frame>> {
//!         match frame.opcode {
//!             Opcode::Text => Some(vec![Frame::text(format!("> {}", frame.as_text()?))]),
//!             _ => None,
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::builder()
//!         .route("/upload", Upload)
//!         .websocket("/chat", Chat)
//!         .build();
//!
//!     Server::builder()
//!         .bind("0.0.0.0", 8080)
//!         .unwrap()
//!         .router(router)
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # Logging
//!
//! The crate emits [`tracing`](https://docs.rs/tracing) events and installs
//! no subscriber: `info` at startup, `debug` per connection and request,
//! `warn` for error responses and failed WebSocket loops, `trace` per frame.

pub(crate) mod http {
    pub(crate) mod body;
    pub(crate) mod cookie;
    pub(crate) mod head;
    pub mod multipart;
    pub mod query;
    pub(crate) mod reader;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod writer;
}
pub(crate) mod ws {
    pub(crate) mod connection;
    pub(crate) mod frame;
    pub(crate) mod handshake;

    pub(crate) use connection::{
        BoxFuture, DynWebSocketHandler, WebSocketConnection, WebSocketHandler,
    };
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod router;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, Result},
    http::{
        body::Body,
        cookie::{Cookie, SameSite},
        head::RequestHead,
        multipart::{self, FilePart, Multipart, PartData},
        query,
        reader::BufferedReader,
        request::{ByteRange, Request, RequestKind, Upgrade},
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Version},
    },
    server::{
        router::{Router, RouterBuilder},
        server_impl::{Handler, RequestGate, Server, ServerBuilder},
    },
    ws::{
        connection::{Socket, WebSocketConnection, WebSocketHandler},
        frame::{Frame, Opcode},
        handshake::accept_key,
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    let head = RequestHead::new(Method::Get, String::from("/"), Version::Http11);
    f(
        &Request::new(head, Body::None, None, limits::MultipartLimits::default()),
        &mut Response::new(),
    );
}

#[doc(hidden)]
#[macro_export]
macro_rules! impl_default_handler {
    ($name:ident) => {
        use kiln::{Handled, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler for $name {
            async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
                resp.status(StatusCode::OK).body("Hello world!")
            }
        }
    };
}
