//! Server configuration: limits, timeouts and worker settings
//!
//! Every struct here implements [`Default`] with values suitable for a small
//! internal service. Override individual fields with struct update syntax.
//!
//! # Examples
//!
//! ```no_run
//! # kiln::impl_default_handler!{MyHandler}
//! use kiln::{Router, Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .bind("127.0.0.1", 8080)
//!         .unwrap()
//!         .router(Router::builder().route("/", MyHandler).build())
//!         .server_limits(ServerLimits {
//!             workers: 16,
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(5),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             body_size: 64 * 1024 * 1024, // 64 MiB uploads
//!             ..ReqLimits::default()
//!         })
//!         .build()
//!         .launch()
//!         .await;
//! }
//! ```

use std::{path::PathBuf, time::Duration};

/// Controls the worker pool and admission queue.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   No    /----------------\   Yes  [-------------]
/// [ Add to queue ] <====== | Queue is full? | =====> [ Sending 503 ]
/// [--------------]         \----------------/        [-------------]
///        ||
///        \==================\\          //====================\
///                            V          V                    ||
/// [--------]   Yes   /-------------------------\   No   [------]
/// [ Worker ] <====== | Is there a free worker? | =====> [ Wait ]
/// [--------]         \-------------------------/        [------]
/// ```
///
/// A worker is a long-running task created once by
/// [`ServerBuilder::build`](crate::ServerBuilder::build). It pops a
/// connection, runs it to completion (head, gates, body, handler, response)
/// and goes back to the queue. Connections upgraded to WebSocket leave the
/// worker and continue on their own task.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker tasks (default: available cores minus one, at least `1`).
    pub workers: usize,

    /// Maximum number of accepted connections waiting for a worker (default: `1024`).
    ///
    /// Connections accepted while the queue is full receive an immediate
    /// `503 Service Unavailable` and are closed.
    pub max_pending_connections: usize,

    /// How idle workers wait for new connections (default: `Sleep(50µs)`).
    pub wait_strategy: WaitStrategy,

    /// Format for error responses (default: `true`)
    ///
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// connection: close\r
    /// content-length: 64\r
    /// content-type: application/json\r
    /// \r
    /// {"error":"Malformed request line","code":"INVALID_REQUEST_LINE"}
    /// ```
    /// If `false`, the body is empty and `content-length` is `0`.
    pub json_errors: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().saturating_sub(1).max(1),
            max_pending_connections: 1024,
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),
            json_errors: true,

            _priv: (),
        }
    }
}

/// Strategy for worker task waiting when no connections are available
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`tokio::task::yield_now()`]
    ///
    /// Lowest latency, but keeps a core busy even when idle.
    Yield,

    /// While waiting, uses [`tokio::time::sleep()`]
    Sleep(Duration),
}

/// Socket timeouts applied to every accepted connection.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum time to wait for data on each socket read (default: `60 seconds`)
    ///
    /// Applies to the request head, the body and multipart streaming.
    /// Upgraded sockets use [`WebSocketLimits::idle_timeout`] instead.
    pub socket_read_timeout: Duration,

    /// Maximum time for a single socket write (default: `60 seconds`)
    pub socket_write_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(60),
            socket_write_timeout: Duration::from_secs(60),

            _priv: (),
        }
    }
}

/// HTTP request parsing limits
///
/// # Body storage
///
/// Bodies up to [`memory_body_size`](Self::memory_body_size) are kept in
/// memory. Larger bodies are streamed to a temporary file in
/// [`temp_dir`](Self::temp_dir) and exposed as
/// [`Body::OnDisk`](crate::Body::OnDisk). Nothing above
/// [`body_size`](Self::body_size) is ever read.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum length of the request line or a single header line (default: `16 KiB`)
    pub max_line_size: usize,

    /// Maximum number of header lines (default: `100`)
    pub header_count: usize,

    /// Absolute ceiling for request bodies in bytes (default: `1 GiB`)
    ///
    /// A `Content-Length` above this value is rejected with `413` before any
    /// body byte is read. Chunked bodies are checked after every chunk.
    pub body_size: u64,

    /// Bodies larger than this spill to a temporary file (default: `1 MiB`)
    pub memory_body_size: u64,

    /// Size of a single socket read while streaming a body (default: `64 KiB`)
    pub read_chunk: usize,

    /// Directory for spilled bodies and uploaded files (default: system temp dir)
    pub temp_dir: Option<PathBuf>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_line_size: 16 * 1024,
            header_count: 100,

            body_size: 1024 * 1024 * 1024,
            memory_body_size: 1024 * 1024,
            read_chunk: 64 * 1024,
            temp_dir: None,

            _priv: (),
        }
    }
}

/// Response writing settings.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Size of a single socket write for body data (default: `64 KiB`)
    pub write_chunk: usize,
    /// Value of the automatic `Server` header (default: `kiln`)
    pub server_name: String,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            write_chunk: 64 * 1024,
            server_name: String::from("kiln"),

            _priv: (),
        }
    }
}

/// Limits for `multipart/form-data` decoding.
#[derive(Debug, Clone)]
pub struct MultipartLimits {
    /// Maximum size of a part's header block (default: `16 KiB`)
    pub max_header_size: usize,
    /// Maximum size of a text field or an in-memory part (default: `1 MiB`)
    pub max_field_size: usize,
    /// Maximum number of parts (default: `1024`)
    pub max_parts: usize,
    /// Accept a body that ends before the closing delimiter (default: `false`)
    ///
    /// When enabled, the part being read is flushed and decoding stops at
    /// end of input. When disabled, a truncated body is an error.
    pub allow_truncated: bool,
    /// Directory for uploaded files (default: system temp dir)
    pub temp_dir: Option<PathBuf>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for MultipartLimits {
    fn default() -> Self {
        Self {
            max_header_size: 16 * 1024,
            max_field_size: 1024 * 1024,
            max_parts: 1024,
            allow_truncated: false,
            temp_dir: None,

            _priv: (),
        }
    }
}

/// Limits for upgraded WebSocket connections.
#[derive(Debug, Clone)]
pub struct WebSocketLimits {
    /// Maximum payload of a single frame (default: `16 MiB`)
    pub max_frame_size: u64,
    /// Maximum size of a reassembled message (default: `64 MiB`)
    pub max_message_size: u64,
    /// Close the loop when nothing arrives for this long (default: disabled)
    pub idle_timeout: Option<Duration>,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WebSocketLimits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            idle_timeout: None,

            _priv: (),
        }
    }
}

/// Every limit a connection needs, shared by all workers.
#[derive(Debug, Clone, Default)]
pub(crate) struct Limits {
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) resp: RespLimits,
    pub(crate) multipart: MultipartLimits,
    pub(crate) ws: WebSocketLimits,
}
