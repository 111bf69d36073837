use crate::{
    errors::{Error, Result},
    http::{
        head::RequestHead,
        request::Request,
        response::{Handled, Response},
        types::Version,
        writer,
    },
    limits::{
        ConnLimits, Limits, MultipartLimits, ReqLimits, RespLimits, ServerLimits, WaitStrategy,
        WebSocketLimits,
    },
    server::{connection, router::Router},
    ws::BoxFuture,
};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    future::Future,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::yield_now,
    time::sleep as tokio_sleep,
};
use tracing::{debug, info};

/// A trait for handling HTTP requests and generating responses.
///
/// Use `&self` for shared immutable data (a database pool, templates, ...).
/// Register handlers on a [`Router`] or pass one straight to
/// [`ServerBuilder::handler`].
///
/// # Examples
/// ```
/// use kiln::{Handler, Request, Response, Handled, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
///         if req.path() == "/echo" {
///             resp.status(StatusCode::OK).body("Echo response")
///         } else {
///             resp.status(StatusCode::NOT_FOUND).body("Not found :(")
///         }
///     }
/// }
/// ```
pub trait Handler
where
    Self: Sync + Send + 'static,
{
    /// Processes an HTTP request and generates a response.
    ///
    /// Implementations should handle errors internally and set appropriate
    /// HTTP status codes on the response. Panics terminate the connection.
    fn handle(&self, request: &Request, response: &mut Response)
        -> impl Future<Output = Handled> + Send;
}

/// Object-safe form of [`Handler`], used by the [`Router`].
pub(crate) trait DynHandler: Send + Sync + 'static {
    fn handle_dyn<'a>(&'a self, request: &'a Request, response: &'a mut Response)
        -> BoxFuture<'a, Handled>;
}

impl<H: Handler> DynHandler for H {
    #[inline]
    fn handle_dyn<'a>(
        &'a self,
        request: &'a Request,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Handled> {
        Box::pin(self.handle(request, response))
    }
}

/// Early accept/reject decisions, taken before the handler runs.
///
/// Both methods accept by default. To reject, build a complete response in
/// `resp` and return its [`Handled`] as the error: the response is written
/// and the connection closed without reading the body.
///
/// - [`on_request_head`](Self::on_request_head) runs right after the head
///   has been parsed (path, method, headers).
/// - [`on_before_body`](Self::on_before_body) runs immediately before the
///   body is read (declared length, content type).
///
/// # Examples
/// ```
/// use kiln::{Handled, RequestGate, RequestHead, Response, StatusCode};
///
/// struct SmallUploads;
///
/// impl RequestGate for SmallUploads {
///     fn on_before_body(&self, head: &RequestHead, resp: &mut Response) -> Result<(), Handled> {
///         match head.content_length() {
///             Some(len) if len > 1024 * 1024 => Err(resp
///                 .status(StatusCode::PAYLOAD_TOO_LARGE)
///                 .body("uploads are limited to 1 MiB")),
///             _ => Ok(()),
///         }
///     }
/// }
/// ```
pub trait RequestGate: Send + Sync + 'static {
    fn on_request_head(&self, _head: &RequestHead, _resp: &mut Response) -> Result<(), Handled> {
        Ok(())
    }

    fn on_before_body(&self, _head: &RequestHead, _resp: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

impl RequestGate for () {}

/// State shared by every worker.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) gate: Box<dyn RequestGate>,
    pub(crate) limits: Limits,
}

/// An HTTP server that processes incoming connections and requests.
///
/// A fixed set of worker tasks pulls accepted connections from a shared
/// queue; each connection serves exactly one request and is closed, unless
/// it was upgraded to a WebSocket.
///
/// # Examples
/// ```no_run
/// use kiln::{Server, Handler, Request, Response, Handled, Router, StatusCode};
///
/// struct Hello;
///
/// impl Handler for Hello {
///     async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::OK).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .bind("127.0.0.1", 8080)
///         .unwrap()
///         .router(Router::builder().route("/", Hello).build())
///         .build()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    stream_queue: TcpQueue,
    error_queue: TcpQueue,
    server_limits: ServerLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            router: None,
            gate: Box::new(()),
            limits: Limits::default(),
        }
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts the server and begins accepting incoming connections.
    ///
    /// Accept errors (for instance running out of file descriptors) are
    /// logged and the loop keeps going.
    pub async fn launch(self) {
        info!(
            addr = ?self.listener.local_addr().ok(),
            workers = self.server_limits.workers,
            "server started"
        );

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(value) => value,
                Err(err) => {
                    debug!(error = %err, "accept failed");
                    continue;
                }
            };
            debug!(peer = %addr, "connection accepted");

            match self.stream_queue.len() < self.server_limits.max_pending_connections {
                true => self.stream_queue.push((stream, addr)),
                false => self.error_queue.push((stream, addr)),
            }
        }
    }

    #[inline]
    async fn get_stream(queue: &TcpQueue, wait: &WaitStrategy) -> (TcpStream, SocketAddr) {
        loop {
            if let Some(value) = queue.pop() {
                return value;
            }

            match wait {
                WaitStrategy::Yield => yield_now().await,
                WaitStrategy::Sleep(time) => tokio_sleep(*time).await,
            }
        }
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    router: Option<Router>,
    gate: Box<dyn RequestGate>,
    limits: Limits,
}

impl ServerBuilder {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// Either this or [`bind`](Self::bind) is required.
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Creates the listening socket for `host:port`.
    ///
    /// The socket gets `SO_REUSEADDR` and a backlog of 1024. An empty host
    /// means `0.0.0.0`. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// [`Error::Bind`] when the address does not resolve or the socket
    /// cannot be bound.
    pub fn bind(mut self, host: &str, port: u16) -> Result<Self> {
        let host = match host.is_empty() {
            true => "0.0.0.0",
            false => host,
        };
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(Error::Bind)?
            .next()
            .ok_or_else(|| Error::Bind(std::io::ErrorKind::AddrNotAvailable.into()))?;

        self.listener = Some(listen(addr).map_err(Error::Bind)?);
        Ok(self)
    }

    /// Sets the routes. Either this or [`handler`](Self::handler) is required.
    #[inline(always)]
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    /// Sends every request to a single handler.
    #[inline]
    pub fn handler<H: Handler>(self, handler: H) -> Self {
        self.router(Router::builder().fallback(handler).build())
    }

    /// Installs the [`RequestGate`] consulted before any body is read.
    #[inline]
    pub fn gate<G: RequestGate>(mut self, gate: G) -> Self {
        self.gate = Box::new(gate);
        self
    }

    /// Configures the worker pool and the admission queue.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.limits.server = limits;
        self
    }

    /// Configures socket timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.limits.conn = limits;
        self
    }

    /// Configures request parsing and body limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.limits.req = limits;
        self
    }

    /// Configures response writing.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.limits.resp = limits;
        self
    }

    /// Configures the decoder behind [`Request::multipart`].
    #[inline(always)]
    pub fn multipart_limits(mut self, limits: MultipartLimits) -> Self {
        self.limits.multipart = limits;
        self
    }

    /// Configures upgraded connections.
    #[inline(always)]
    pub fn websocket_limits(mut self, limits: WebSocketLimits) -> Self {
        self.limits.ws = limits;
        self
    }

    /// Finalizes the builder, spawns the workers and constructs a
    /// [`Server`] instance. Must be called inside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Error messages:
    /// - ``The `listener` or `bind` method must be called to create``
    /// - ``The `router` or `handler` method must be called to create``
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server {
        let (listener, shared) = self.get_all_parts();

        let stream_queue = Arc::new(SegQueue::new());
        let error_queue = Arc::new(SegQueue::new());

        for _ in 0..shared.limits.server.workers.max(1) {
            Self::spawn_worker(&stream_queue, &shared);
        }
        Self::spawn_alarmist(&error_queue, &shared.limits);

        Server {
            listener,
            stream_queue,
            error_queue,
            server_limits: shared.limits.server.clone(),
        }
    }

    #[inline]
    fn spawn_worker(queue: &TcpQueue, shared: &Arc<Shared>) {
        let queue = queue.clone();
        let shared = shared.clone();

        tokio::spawn(async move {
            loop {
                let (stream, addr) =
                    Server::get_stream(&queue, &shared.limits.server.wait_strategy).await;

                connection::serve(&shared, stream, Some(addr)).await;
            }
        });
    }

    #[inline]
    fn spawn_alarmist(queue: &TcpQueue, limits: &Limits) {
        let queue = queue.clone();
        let (server_limits, conn_limits) = (limits.server.clone(), limits.conn.clone());
        let response = Error::Overloaded.to_http(Version::Http11, server_limits.json_errors);

        tokio::spawn(async move {
            loop {
                let (mut stream, addr) =
                    Server::get_stream(&queue, &server_limits.wait_strategy).await;
                debug!(peer = %addr, "queue full, answering 503");

                let _ = writer::write_bytes(&mut stream, &response, conn_limits.socket_write_timeout)
                    .await;
                let _ = stream.shutdown().await;
            }
        });
    }

    #[inline]
    #[track_caller]
    fn get_all_parts(self) -> (TcpListener, Arc<Shared>) {
        (
            self.listener
                .expect("The `listener` or `bind` method must be called to create"),
            Arc::new(Shared {
                router: self
                    .router
                    .expect("The `router` or `handler` method must be called to create"),
                gate: self.gate,
                limits: self.limits,
            }),
        )
    }
}

fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;
