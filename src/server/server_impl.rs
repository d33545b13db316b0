use crate::{
    http::body::{BodyData, BodyParser, BodyParsers},
    limits::{ReqLimits, ServerLimits, WsLimits},
    server::{
        connection::{ConnectionId, HandlerKind},
        http_handler::HttpProtocol,
        reactor::{Protocol, Reactor, Registrar, Registry},
        ws_handler::{Message, WsContext, WsProtocol, WsSender},
    },
    ws::close::CloseCode,
    Handled, Request, Response,
};
use socket2::SockRef;
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tokio::net::{TcpListener, TcpStream};

/// Application callbacks for HTTP requests and WebSocket connections.
///
/// Every method runs on a selector thread: keep them short and never block.
/// Long work belongs on another thread that answers through a [`WsSender`].
/// A panic inside a callback closes only the connection that caused it.
///
/// # Examples
///
/// Plain HTTP
/// ```
/// use maker_ws::{BodyData, Handled, Handler, Request, Response, StatusCode};
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     fn handle(&self, req: &Request, _: &BodyData, resp: &mut Response) -> Handled {
///         if req.path() == "/echo" {
///             resp.status(StatusCode::Ok).body(req.query().unwrap_or_default().to_owned())
///         } else {
///             resp.status(StatusCode::NotFound).body("Not found :(")
///         }
///     }
/// }
/// ```
/// HTTP plus WebSocket
/// ```
/// use maker_ws::{
///     BodyData, CloseCode, ConnectionId, Handled, Handler, Message, Request, Response,
///     StatusCode, WsContext,
/// };
///
/// struct Upper;
///
/// impl Handler for Upper {
///     fn handle(&self, req: &Request, _: &BodyData, resp: &mut Response) -> Handled {
///         match req.path() {
///             "/ws" => resp.upgrade_websocket(req),
///             _ => resp.status(StatusCode::NotFound).body(""),
///         }
///     }
///
///     fn on_message(&self, ctx: &mut WsContext, message: Message) {
///         if let Message::Text(text) = message {
///             ctx.send_text(&text.to_uppercase());
///         }
///     }
///
///     fn on_close(&self, id: ConnectionId, code: CloseCode) {
///         println!("{id} closed with {}", code.as_u16());
///     }
/// }
/// ```
pub trait Handler
where
    Self: Sync + Send + 'static,
{
    /// Answers one HTTP request.
    ///
    /// `body` holds whatever the first matching [`BodyParser`] produced, or
    /// nothing. Call [`Response::upgrade_websocket`] to move the connection
    /// to the WebSocket loop.
    fn handle(&self, request: &Request, body: &BodyData, response: &mut Response) -> Handled;

    /// A connection has just been handed over to the WebSocket loop.
    fn on_open(&self, _ctx: &mut WsContext) {}

    /// A complete message arrived.
    fn on_message(&self, _ctx: &mut WsContext, _message: Message) {}

    /// The WebSocket connection is gone.
    ///
    /// `code` is the code from the peer's close frame, the code this side
    /// sent, or [`CloseCode::Abnormal`] when the socket dropped without one.
    fn on_close(&self, _id: ConnectionId, _code: CloseCode) {}
}

/// An HTTP/1.1 and WebSocket server.
///
/// Accepting runs on the tokio runtime that awaits [`launch`](Self::launch).
/// HTTP and WebSocket traffic run on two dedicated threads, one `mio`
/// selector each, started by [`ServerBuilder::build`].
///
/// # Examples
///
/// ```no_run
/// use maker_ws::{BodyData, Handled, Handler, Request, Response, Server, StatusCode};
/// use tokio::net::TcpListener;
///
/// struct MyHandler;
///
/// impl Handler for MyHandler {
///     fn handle(&self, _: &Request, _: &BodyData, resp: &mut Response) -> Handled {
///         resp.status(StatusCode::Ok).body("Hello world!")
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .unwrap()
///         .launch()
///         .await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    http: Registrar,
    ws_sender: WsSender,
    alive: Arc<AtomicUsize>,
    limits: ServerLimits,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder<H: Handler>() -> ServerBuilder<H> {
        ServerBuilder {
            listener: None,
            handler: None,
            body_parsers: BodyParsers::default(),

            server_limits: None,
            request_limits: None,
            websocket_limits: None,
        }
    }

    /// Handle for pushing frames to WebSocket connections from other threads.
    #[inline]
    pub fn ws_sender(&self) -> WsSender {
        self.ws_sender.clone()
    }

    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of sockets currently owned by either loop.
    #[inline]
    pub fn connection_count(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    /// Accepts connections forever, handing each one to the HTTP loop.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_ws::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_ws::Server;
    /// use tokio::net::TcpListener;
    ///
    /// Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .build()
    ///     .unwrap()
    ///     .launch()
    ///     .await
    /// # }
    /// ```
    pub async fn launch(self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, "Accept failed");
                    continue;
                }
            };

            if self.alive.load(Ordering::Acquire) >= self.limits.max_connections {
                tracing::debug!(%addr, "Connection limit reached, dropping");
                continue;
            }

            if let Err(err) = self.admit(stream) {
                tracing::warn!(%addr, error = %err, "Could not register connection");
            }
        }
    }

    fn admit(&self, stream: TcpStream) -> io::Result<()> {
        if self.limits.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        if self.limits.tcp_keepalive {
            SockRef::from(&stream).set_keepalive(true)?;
        }

        let stream = stream.into_std()?;
        stream.set_nonblocking(true)?;
        let stream = mio::net::TcpStream::from_std(stream);

        let id = ConnectionId::new();
        self.alive.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(%id, "Connection accepted");

        self.http.register(stream, id)
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<H: Handler> {
    listener: Option<TcpListener>,
    handler: Option<Arc<H>>,
    body_parsers: BodyParsers,

    server_limits: Option<ServerLimits>,
    request_limits: Option<ReqLimits>,
    websocket_limits: Option<WsLimits>,
}

impl<H: Handler> ServerBuilder<H> {
    /// Sets the TCP listener that the server will use to accept connections.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets the application callbacks.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn handler(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Appends a body parser. Parsers are tried in the order they were added,
    /// the first whose [`matches`](BodyParser::matches) returns `true` wins.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_ws::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_ws::{FormParser, Server};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct)
    ///     .body_parser(FormParser)
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn body_parser<P: BodyParser>(mut self, parser: P) -> Self {
        self.body_parsers.push(Box::new(parser));
        self
    }

    /// Configures connection admission and the selector loops.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # maker_ws::impt_default_handler!{ MyStruct }
    /// # #[tokio::main]
    /// # async fn main() {
    /// use maker_ws::{Server, limits::ServerLimits};
    /// use tokio::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
    ///     .handler(MyStruct) // structure with Handler implementation
    ///     .server_limits(ServerLimits {
    ///         // Your changes
    ///         max_connections: 2500,
    ///         tcp_nodelay: false,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// # }
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures WebSocket frame and message limits.
    #[inline(always)]
    pub fn websocket_limits(mut self, limits: WsLimits) -> Self {
        self.websocket_limits = Some(limits);
        self
    }

    /// Starts the HTTP and WebSocket threads and returns the [`Server`].
    ///
    /// # Errors
    ///
    /// - [`io::ErrorKind::InvalidInput`] when `listener` or `handler` was not set.
    /// - Any error from creating a `mio::Poll` or spawning a thread.
    pub fn build(self) -> io::Result<Server> {
        let listener = self.listener.ok_or_else(|| missing("listener"))?;
        let handler = self.handler.ok_or_else(|| missing("handler"))?;

        let limits = self.server_limits.unwrap_or_default();
        let alive = Arc::new(AtomicUsize::new(0));

        let mut http = Reactor::new(
            HttpProtocol::new(
                handler.clone(),
                Arc::new(self.body_parsers),
                self.request_limits.unwrap_or_default(),
            ),
            alive.clone(),
            limits.events_capacity,
        )?;
        let mut websocket = Reactor::new(
            WsProtocol::new(handler, self.websocket_limits.unwrap_or_default()),
            alive.clone(),
            limits.events_capacity,
        )?;

        let registry = Registry::new(http.registrar(), websocket.registrar());
        http.set_registry(registry.clone());
        websocket.set_registry(registry.clone());

        let ws_sender = WsSender(websocket.commands());

        spawn_reactor(http)?;
        spawn_reactor(websocket)?;

        Ok(Server {
            listener,
            http: registry.get(HandlerKind::Http).clone(),
            ws_sender,
            alive,
            limits,
        })
    }
}

fn missing(method: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("The `{method}` method must be called to create"),
    )
}

fn spawn_reactor<P: Protocol>(reactor: Reactor<P>) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("maker-ws-{}", P::KIND.as_str()))
        .spawn(move || {
            if let Err(err) = reactor.run() {
                tracing::error!(handler = ?P::KIND, error = %err, "Reactor stopped");
            }
        })?;

    Ok(())
}
