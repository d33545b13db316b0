//! maker_ws - Embedded HTTP/1.1 and WebSocket server on selector loops
//!
//! Terminates raw TCP sockets, parses HTTP/1.1 requests incrementally and
//! speaks the WebSocket protocol ([RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455))
//! after an HTTP upgrade.
//!
//! # Architecture
//!
//! ```text
//!  tokio accept loop
//!        |
//!        v  Registrar (SegQueue + mio::Waker)
//!  [ HTTP reactor ]  -- 101 Switching Protocols, hand-off -->  [ WebSocket reactor ]
//!   one OS thread,                                              one OS thread,
//!   one mio::Poll                                               one mio::Poll
//! ```
//!
//! - **One thread per protocol**: every socket is owned by exactly one
//!   selector loop at a time, per-connection state needs no locks.
//! - **Incremental parsing**: short reads and short writes simply resume on
//!   the next readiness event.
//! - **Fault isolation**: I/O errors, malformed requests and panics in
//!   [`Handler`] callbacks close only the connection that caused them.
//! - **Keep-alive and pipelining**: bytes after a request stay buffered and
//!   are answered in order.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1 and HTTP/1.0**: `content-length` bodies. No chunked encoding.
//! - **WebSocket**: text, binary, fragmentation, ping/pong, close handshake.
//!   No extensions (compression), no TLS.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use maker_ws::{BodyData, Handled, Handler, Request, Response, Server, StatusCode};
//! use tokio::net::TcpListener;
//!
//! struct MyHandler;
//!
//! impl Handler for MyHandler {
//!     fn handle(&self, _: &Request, _: &BodyData, resp: &mut Response) -> Handled {
//!         resp.status(StatusCode::Ok).body("Hello World!")
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(MyHandler)
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```
//! WebSocket echo:
//! ```no_run
//! use maker_ws::{
//!     BodyData, Handled, Handler, Message, Request, Response, Server, StatusCode, WsContext,
//! };
//! use tokio::net::TcpListener;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn handle(&self, req: &Request, _: &BodyData, resp: &mut Response) -> Handled {
//!         match req.path() {
//!             "/ws" => resp.upgrade_websocket(req),
//!             _ => resp.status(StatusCode::NotFound).body("Not found"),
//!         }
//!     }
//!
//!     fn on_message(&self, ctx: &mut WsContext, message: Message) {
//!         match message {
//!             Message::Text(text) => ctx.send_text(text),
//!             Message::Binary(data) => ctx.send_binary(data),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     Server::builder()
//!         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
//!         .handler(Echo)
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! # Logging
//!
//! Connection events are reported through [`tracing`]. The crate never
//! installs a subscriber.

pub(crate) mod http {
    pub(crate) mod body;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod ws {
    pub(crate) mod close;
    pub(crate) mod frame;
    pub(crate) mod handshake;
    pub(crate) mod protocol;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod http_handler;
    pub(crate) mod reactor;
    pub(crate) mod server_impl;
    pub(crate) mod ws_handler;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    http::{
        body::{BodyData, BodyField, BodyParser, FormParser},
        query::{self, QueryPairs},
        request::Request,
        response::{
            write::{BodyWriter, WriteBuffer},
            Handled, Response,
        },
        types::{Method, StatusCode, Version},
    },
    server::{
        connection::{ConnectionId, HandlerKind},
        server_impl::{Handler, Server, ServerBuilder},
        ws_handler::{Message, WsContext, WsSender},
    },
    ws::{
        close::CloseCode,
        frame::{apply_mask, FrameHeader, OpCode},
        handshake::accept_key,
    },
};

#[doc(hidden)]
pub fn run_test<F: FnOnce(&Request, &mut Response) -> Handled>(f: F) {
    let mut buffer = b"GET / HTTP/1.1\r\n\r\n".to_vec();

    if let Ok(Some(req)) = Request::parse(&mut buffer, &limits::ReqLimits::default()) {
        f(&req, &mut Response::new(req.version(), req.is_keep_alive()));
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_handler {
    ($name:ident) => {
        use maker_ws::{BodyData, Handled, Handler, Request, Response, StatusCode};
        struct $name;

        impl Handler for $name {
            fn handle(&self, _: &Request, _: &BodyData, resp: &mut Response) -> Handled {
                resp.status(StatusCode::Ok).body("Hello world!")
            }
        }
    };
}

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
