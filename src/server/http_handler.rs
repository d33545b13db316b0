use crate::{
    errors::ErrorKind,
    http::body::BodyParsers,
    limits::ReqLimits,
    server::{
        connection::{ConnectionId, HandlerKind},
        reactor::{read_chunk, write_buf, Protocol, Step},
    },
    Handler, Request, Response,
};
use mio::net::TcpStream;
use std::{
    convert::Infallible,
    io::{Read, Write},
    sync::Arc,
};

pub(crate) struct HttpProtocol<H: Handler> {
    handler: Arc<H>,
    parsers: Arc<BodyParsers>,
    limits: ReqLimits,
}

#[derive(Debug, Default)]
pub(crate) struct HttpState {
    buffer: Vec<u8>,
    staged: Option<Staged>,
}

/// A computed response waiting to be written, header bytes first.
#[derive(Debug)]
struct Staged {
    head: Vec<u8>,
    head_pos: usize,
    body: Vec<u8>,
    body_pos: usize,

    keep_alive: bool,
    handoff: Option<HandlerKind>,
}

impl<H: Handler> HttpProtocol<H> {
    pub(crate) fn new(handler: Arc<H>, parsers: Arc<BodyParsers>, limits: ReqLimits) -> Self {
        Self {
            handler,
            parsers,
            limits,
        }
    }

    /// Parses and answers requests until a response is staged or the
    /// socket runs dry.
    fn read<S: Read>(&self, id: ConnectionId, state: &mut HttpState, stream: &mut S) -> Result<Step, ErrorKind> {
        loop {
            if state.staged.is_some() {
                return Ok(Step::Continue);
            }

            // Pipelined bytes from an earlier read are parsed before reading more
            if let Some(mut request) = Request::parse(&mut state.buffer, &self.limits)? {
                request.connection_id = id;
                state.staged = Some(self.respond(&request));
                continue;
            }

            if !read_chunk(stream, &mut state.buffer, self.limits.read_chunk)? {
                return Ok(Step::Continue);
            }
        }
    }

    fn respond(&self, request: &Request) -> Staged {
        let body = self.parsers.parse(request);
        let mut response = Response::new(request.version(), request.is_keep_alive());

        self.handler.handle(request, &body, &mut response);
        debug_assert!(response.is_complete(), "`Handled` must come from this response");

        let keep_alive = response.keep_alive;
        let handoff = response.handoff.filter(|kind| *kind != HandlerKind::Http);
        let (head, body) = response.into_staged();

        Staged {
            head,
            head_pos: 0,
            body,
            body_pos: 0,

            keep_alive,
            handoff,
        }
    }

    /// Writes staged responses until the socket would block. Requests that
    /// were already buffered are answered within the same call, the socket
    /// stays writable and no further writable event will arrive for them.
    fn write<S: Read + Write>(
        &self,
        id: ConnectionId,
        state: &mut HttpState,
        stream: &mut S,
    ) -> Result<Step, ErrorKind> {
        loop {
            let Some(staged) = &mut state.staged else {
                return Ok(Step::Continue);
            };

            if !write_buf(stream, &staged.head, &mut staged.head_pos)?
                || !write_buf(stream, &staged.body, &mut staged.body_pos)?
            {
                return Ok(Step::Continue);
            }

            let (keep_alive, handoff) = (staged.keep_alive, staged.handoff);
            state.staged = None;

            match handoff {
                Some(kind) => {
                    if !state.buffer.is_empty() {
                        tracing::debug!(%id, bytes = state.buffer.len(), "Bytes after upgrade discarded");
                    }
                    return Ok(Step::Handoff(kind));
                }
                None if !keep_alive => return Ok(Step::Close),
                None => match self.read(id, state, stream)? {
                    Step::Continue => {}
                    step => return Ok(step),
                },
            }
        }
    }
}

impl<H: Handler> Protocol for HttpProtocol<H> {
    type State = HttpState;
    type Command = Infallible;

    const KIND: HandlerKind = HandlerKind::Http;

    #[inline]
    fn open(&mut self, _: ConnectionId) -> HttpState {
        HttpState::default()
    }

    #[inline]
    fn on_read(&mut self, id: ConnectionId, state: &mut HttpState, stream: &mut TcpStream) -> Result<Step, ErrorKind> {
        self.read(id, state, stream)
    }

    #[inline]
    fn on_write(&mut self, id: ConnectionId, state: &mut HttpState, stream: &mut TcpStream) -> Result<Step, ErrorKind> {
        self.write(id, state, stream)
    }

    #[inline]
    fn has_pending_write(&self, state: &HttpState) -> bool {
        state.staged.is_some()
    }

    fn on_command(&mut self, _: ConnectionId, _: &mut HttpState, command: Infallible) -> Step {
        match command {}
    }

    #[inline]
    fn on_close(&mut self, _: ConnectionId, _: HttpState) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tools::*, BodyData, FormParser, Handled, StatusCode};
    use std::io;

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, req: &Request, body: &BodyData, resp: &mut Response) -> Handled {
            match req.path() {
                "/ws" => resp.upgrade_websocket(req),
                "/form" => resp
                    .status(StatusCode::Ok)
                    .body(body.text("name").unwrap_or("-").to_owned()),
                "/id" => resp
                    .status(StatusCode::Ok)
                    .body(req.connection_id().to_string()),
                path => resp.status(StatusCode::Ok).body(path.to_owned()),
            }
        }
    }

    /// In-memory socket: reads drain `input`, writes accept `budget` bytes.
    struct Duplex {
        input: Vec<u8>,
        output: Vec<u8>,
        budget: usize,
    }

    impl Duplex {
        fn new(input: &str) -> Self {
            Self {
                input: input.as_bytes().to_vec(),
                output: Vec::new(),
                budget: usize::MAX,
            }
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.input.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.input.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.input.drain(..n);
            Ok(n)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.output.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn protocol() -> HttpProtocol<Echo> {
        let mut parsers = BodyParsers::default();
        parsers.push(Box::new(FormParser));

        HttpProtocol::new(
            Arc::new(Echo),
            Arc::new(parsers),
            ReqLimits {
                read_chunk: 7,
                ..ReqLimits::default()
            },
        )
    }

    /// One readable and writable event, the way the reactor delivers it.
    fn run(proto: &HttpProtocol<Echo>, state: &mut HttpState, stream: &mut Duplex) -> Result<Step, ErrorKind> {
        let id = ConnectionId::nil();
        match proto.read(id, state, stream)? {
            Step::Continue => proto.write(id, state, stream),
            step => Ok(step),
        }
    }

    #[test]
    fn pipelined_requests_in_order() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new("GET /a HTTP/1.1\r\n\r\nGET /bb HTTP/1.1\r\n\r\nGET /c");

        assert_eq!(run(&proto, &mut state, &mut stream), Ok(Step::Continue));
        assert_eq!(
            str_op(&stream.output),
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n/a\
             HTTP/1.1 200 OK\r\ncontent-length: 3\r\n\r\n/bb"
        );
        assert_eq!(state.buffer, b"GET /c");
    }

    #[test]
    fn pipelined_requests_after_blocked_write() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new("GET /one HTTP/1.1\r\n\r\nGET /two HTTP/1.1\r\n\r\n");
        stream.budget = 5;

        assert_eq!(run(&proto, &mut state, &mut stream), Ok(Step::Continue));
        assert_eq!(stream.output.len(), 5);

        // A single writable event must answer everything already buffered
        stream.budget = usize::MAX;
        let id = ConnectionId::nil();
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Continue));
        assert!(state.staged.is_none());
        assert_eq!(
            str_op(&stream.output),
            "HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\n/one\
             HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\n/two"
        );
    }

    #[test]
    fn keep_alive_close_ends_pipeline() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new(
            "GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\nconnection: close\r\n\r\nGET /c HTTP/1.1\r\n\r\n",
        );

        assert_eq!(run(&proto, &mut state, &mut stream), Ok(Step::Close));
        let output = str_op(&stream.output);
        assert!(output.ends_with("connection: close\r\ncontent-length: 2\r\n\r\n/b"));
        assert!(!output.contains("/c"));
    }

    #[test]
    fn close_after_response() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\nConnection: close\r\n\r\n", Step::Close),
            ("GET / HTTP/1.0\r\n\r\n",                       Step::Close),
            ("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", Step::Continue),
            ("GET / HTTP/1.1\r\n\r\n",                       Step::Continue),
        ];

        for (input, expected) in cases {
            let proto = protocol();
            let mut state = HttpState::default();
            let mut stream = Duplex::new(input);

            assert_eq!(run(&proto, &mut state, &mut stream), Ok(expected), "{input:?}");
            assert!(state.staged.is_none());
        }
    }

    #[test]
    fn body_is_parsed() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new(
            "POST /form HTTP/1.1\r\ncontent-type: application/x-www-form-urlencoded\r\n\
             content-length: 9\r\n\r\nname=anna",
        );

        run(&proto, &mut state, &mut stream).unwrap();
        assert!(str_op(&stream.output).ends_with("\r\n\r\nanna"));
    }

    #[test]
    fn partial_writes_head_then_body() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new("GET /partial HTTP/1.1\r\n\r\n");
        stream.budget = 10;

        let id = ConnectionId::nil();
        assert_eq!(proto.read(id, &mut state, &mut stream), Ok(Step::Continue));
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Continue));
        assert!(state.staged.is_some());
        assert_eq!(stream.output.len(), 10);

        stream.budget = usize::MAX;
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Continue));
        assert!(state.staged.is_none());
        assert_eq!(
            str_op(&stream.output),
            "HTTP/1.1 200 OK\r\ncontent-length: 8\r\n\r\n/partial"
        );
    }

    #[test]
    fn upgrade_hands_off_after_write() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new(
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );

        assert_eq!(
            run(&proto, &mut state, &mut stream),
            Ok(Step::Handoff(HandlerKind::WebSocket))
        );
        assert!(str_op(&stream.output).starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    }

    #[test]
    fn fatal_errors_close_without_response() {
        #[rustfmt::skip]
        let cases = [
            ("GET /\r\n\r\n",                            ErrorKind::InvalidRequestLine),
            ("GET / HTTP/1.1\r\nbroken\r\n\r\n",         ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\ncontent-length: x\r\n\r\n", ErrorKind::InvalidContentLength),
        ];

        for (input, expected) in cases {
            let proto = protocol();
            let mut state = HttpState::default();
            let mut stream = Duplex::new(input);

            assert_eq!(run(&proto, &mut state, &mut stream), Err(expected), "{input:?}");
            assert!(stream.output.is_empty());
        }
    }

    #[test]
    fn request_carries_connection_id() {
        let proto = protocol();
        let mut state = HttpState::default();
        let mut stream = Duplex::new("GET /id HTTP/1.1\r\n\r\n");
        let id = ConnectionId::new();

        proto.read(id, &mut state, &mut stream).unwrap();
        proto.write(id, &mut state, &mut stream).unwrap();

        assert!(str_op(&stream.output).ends_with(&id.to_string()));
    }
}
