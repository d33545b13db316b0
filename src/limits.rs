//! Server configuration limits
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Unbounded read buffers (header flooding, oversized bodies)
//! - Oversized WebSocket frames and messages
//! - File descriptor exhaustion
//!
//! # Memory Consumption
//!
//! Read buffers grow in [`ReqLimits::read_chunk`] / [`WsLimits::read_chunk`]
//! steps and never beyond the largest message the limits allow. A WebSocket
//! frame reserves at most one `read_chunk` for its payload up front, whatever
//! length its header declares. Queued output is bounded by
//! [`WsLimits::max_pending_write`] plus the replies to one read chunk.
//!
//! # Examples
//!
//! ```no_run
//! # maker_ws::impt_default_handler!{MyHandler}
//! use maker_ws::{Server, limits::{ReqLimits, ServerLimits, WsLimits}};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .server_limits(ServerLimits {
//!             max_connections: 5000,
//!             ..ServerLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             body_size: 64 * 1024,
//!             ..ReqLimits::default()
//!         })
//!         .websocket_limits(WsLimits {
//!             max_message_size: 1024 * 1024,
//!             ..WsLimits::default()
//!         })
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```

/// Controls connection admission and the selector loops.
///
/// # Connection management
/// ```text
///   [------------]
///   [ Tcp accept ]   tokio task
///   [------------]
///         ||
///         \/
///  /-----------------\   Yes   [------------]
///  | Too many alive? | ======> [ Drop stream ]
///  \-----------------/         [------------]
///         || No
///         \/
///   [--------------]  hand-off  [-------------------]
///   [ HTTP thread  ] =========> [ WebSocket thread  ]
///   [ (mio::Poll)  ]            [ (mio::Poll)       ]
///   [--------------]            [-------------------]
/// ```
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of sockets alive across all handlers (default: `1024`).
    ///
    /// A socket counts from accept until it is closed by whichever handler
    /// owns it; a hand-off does not change the count. Connections accepted
    /// above the limit are closed immediately without a response.
    pub max_connections: usize,

    /// Capacity of the `mio::Events` buffer for each loop (default: `1024`).
    pub events_capacity: usize,

    /// Sets `TCP_NODELAY` on accepted sockets (default: `true`).
    pub tcp_nodelay: bool,

    /// Enables `SO_KEEPALIVE` on accepted sockets (default: `true`).
    pub tcp_keepalive: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            events_capacity: 1024,
            tcp_nodelay: true,
            tcp_keepalive: true,

            _priv: (),
        }
    }
}

/// HTTP request limits.
///
/// Requests are parsed from a single growable buffer. These limits cap how
/// far that buffer may grow before the connection is considered hostile.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum size of request line plus headers, including the final
    /// `\r\n\r\n` (default: `8 KiB`).
    pub header_size: usize,

    /// Maximum accepted `Content-Length` (default: `1 MiB`).
    pub body_size: usize,

    /// Bytes requested from the socket per `read` call (default: `4 KiB`).
    pub read_chunk: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            header_size: 8 * 1024,
            body_size: 1024 * 1024,
            read_chunk: 4 * 1024,

            _priv: (),
        }
    }
}

/// WebSocket limits.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Largest payload a single frame may declare (default: `32 MiB`).
    ///
    /// Larger frames are answered with close code `1009` (message too big).
    pub max_payload_size: u64,

    /// Largest message after continuation frames are joined (default: `32 MiB`).
    pub max_message_size: usize,

    /// Bytes requested from the socket per `read` call (default: `16 KiB`).
    pub read_chunk: usize,

    /// Outbound backlog at which a connection stops reading (default: `1 MiB`).
    ///
    /// Pongs and replies queued by handlers count towards it. Reading
    /// resumes once the peer has accepted the whole backlog, so a client
    /// that sends without ever reading cannot grow the queue further.
    pub max_pending_write: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_payload_size: 32 * 1024 * 1024,
            max_message_size: 32 * 1024 * 1024,
            read_chunk: 16 * 1024,
            max_pending_write: 1024 * 1024,

            _priv: (),
        }
    }
}
