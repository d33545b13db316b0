use crate::{
    errors::ErrorKind,
    limits::WsLimits,
    server::{
        connection::{ConnectionId, HandlerKind},
        reactor::{read_chunk, Commands, Protocol, Step},
    },
    ws::{
        close::CloseCode,
        frame::{OpCode, MAX_CONTROL_PAYLOAD},
        protocol::{Incoming, WsState},
    },
    Handler,
};
use mio::net::TcpStream;
use std::{
    io::{self, Read, Write},
    mem,
    sync::Arc,
};

/// A complete WebSocket message, continuation frames already joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    /// Valid UTF-8, checked before delivery.
    Text(&'a str),
    Binary(&'a [u8]),
}

impl<'a> Message<'a> {
    #[inline]
    pub const fn as_bytes(&self) -> &'a [u8] {
        match *self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }
}

/// Access to one WebSocket connection during a [`Handler`] callback.
///
/// Frames are queued in call order and written once the callback returns.
/// After [`close`](Self::close) every further send is ignored.
///
/// # Examples
/// ```
/// use maker_ws::{BodyData, Handled, Handler, Message, Request, Response, WsContext};
///
/// struct Echo;
///
/// impl Handler for Echo {
///     fn handle(&self, req: &Request, _: &BodyData, resp: &mut Response) -> Handled {
///         resp.upgrade_websocket(req)
///     }
///
///     fn on_message(&self, ctx: &mut WsContext, message: Message) {
///         match message {
///             Message::Text(text) => ctx.send_text(text),
///             Message::Binary(data) => ctx.send_binary(data),
///         }
///     }
/// }
/// ```
pub struct WsContext<'a> {
    id: ConnectionId,
    state: &'a mut WsState,
}

impl WsContext<'_> {
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn send_text(&mut self, text: &str) {
        self.state.queue_frame(OpCode::Text, text.as_bytes());
    }

    #[inline]
    pub fn send_binary(&mut self, data: &[u8]) {
        self.state.queue_frame(OpCode::Binary, data);
    }

    /// Sends a ping. Only the first 125 bytes of `payload` are used.
    #[inline]
    pub fn ping(&mut self, payload: &[u8]) {
        let len = payload.len().min(MAX_CONTROL_PAYLOAD as usize);
        self.state.queue_frame(OpCode::Ping, &payload[..len]);
    }

    /// Starts the close handshake. The socket is closed once queued frames
    /// are written.
    #[inline]
    pub fn close(&mut self, code: CloseCode) {
        self.state.queue_close(code);
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.state.is_closing()
    }
}

pub(crate) enum WsCommand {
    Text(String),
    Binary(Vec<u8>),
    Close(CloseCode),
}

/// Queues frames for WebSocket connections from any thread.
///
/// Obtained from [`Server::ws_sender`](crate::Server::ws_sender). Frames for
/// ids that are unknown or already closing are dropped silently.
///
/// # Examples
/// ```no_run
/// # maker_ws::impt_default_handler!{MyHandler}
/// use maker_ws::Server;
/// use tokio::net::TcpListener;
///
/// #[tokio::main]
/// async fn main() {
///     let server = Server::builder()
///         .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
///         .handler(MyHandler)
///         .build()
///         .unwrap();
///
///     let sender = server.ws_sender();
///     std::thread::spawn(move || {
///         let id = maker_ws::ConnectionId::nil();
///         let _ = sender.send_text(id, "tick");
///     });
///
///     server.launch().await;
/// }
/// ```
#[derive(Clone)]
pub struct WsSender(pub(crate) Commands<WsCommand>);

impl WsSender {
    /// Fails only when the WebSocket loop cannot be woken.
    #[inline]
    pub fn send_text<T: Into<String>>(&self, id: ConnectionId, text: T) -> io::Result<()> {
        self.0.push(id, WsCommand::Text(text.into()))
    }

    #[inline]
    pub fn send_binary<T: Into<Vec<u8>>>(&self, id: ConnectionId, data: T) -> io::Result<()> {
        self.0.push(id, WsCommand::Binary(data.into()))
    }

    #[inline]
    pub fn close(&self, id: ConnectionId, code: CloseCode) -> io::Result<()> {
        self.0.push(id, WsCommand::Close(code))
    }
}

pub(crate) struct WsProtocol<H: Handler> {
    handler: Arc<H>,
    limits: WsLimits,

    scratch: Vec<u8>,
    messages: Vec<Incoming>,
}

impl<H: Handler> WsProtocol<H> {
    pub(crate) fn new(handler: Arc<H>, limits: WsLimits) -> Self {
        Self {
            handler,
            limits,

            scratch: Vec::new(),
            messages: Vec::new(),
        }
    }

    fn read<S: Read>(&mut self, id: ConnectionId, state: &mut WsState, stream: &mut S) -> Result<Step, ErrorKind> {
        loop {
            if state.is_closing() {
                return Ok(Step::Close);
            }

            if state.pending_bytes() >= self.limits.max_pending_write {
                tracing::trace!(%id, pending = state.pending_bytes(), "Reading paused");
                state.pause_reading();
                return Ok(Step::Continue);
            }

            self.scratch.clear();
            if !read_chunk(stream, &mut self.scratch, self.limits.read_chunk)? {
                return Ok(Step::Continue);
            }

            let mut messages = mem::take(&mut self.messages);
            state.feed(&self.scratch, &self.limits, &mut messages);

            for message in messages.drain(..) {
                // Messages behind a close from `on_message` are dropped
                if state.is_closing() {
                    break;
                }

                let mut ctx = WsContext {
                    id,
                    state: &mut *state,
                };
                let message = match &message {
                    Incoming::Text(text) => Message::Text(text),
                    Incoming::Binary(data) => Message::Binary(data),
                };
                self.handler.on_message(&mut ctx, message);
            }
            self.messages = messages;
        }
    }

    /// Flushes queued frames, then picks up input left unread while the
    /// queue was full. Loops because that input may queue more frames.
    fn write<S: Read + Write>(&mut self, id: ConnectionId, state: &mut WsState, stream: &mut S) -> Result<Step, ErrorKind> {
        loop {
            let flushed = state.flush(stream)?;

            if state.is_closing() {
                if flushed {
                    tracing::debug!(%id, code = ?state.close_code(), "Close frame sent");
                }
                return Ok(Step::Close);
            }

            if !flushed || !state.resume_reading() {
                return Ok(Step::Continue);
            }

            match self.read(id, state, stream)? {
                Step::Continue => {}
                step => return Ok(step),
            }
        }
    }
}

impl<H: Handler> Protocol for WsProtocol<H> {
    type State = WsState;
    type Command = WsCommand;

    const KIND: HandlerKind = HandlerKind::WebSocket;

    fn open(&mut self, id: ConnectionId) -> WsState {
        let mut state = WsState::new();
        self.handler.on_open(&mut WsContext {
            id,
            state: &mut state,
        });
        state
    }

    #[inline]
    fn on_read(&mut self, id: ConnectionId, state: &mut WsState, stream: &mut TcpStream) -> Result<Step, ErrorKind> {
        self.read(id, state, stream)
    }

    #[inline]
    fn on_write(&mut self, id: ConnectionId, state: &mut WsState, stream: &mut TcpStream) -> Result<Step, ErrorKind> {
        self.write(id, state, stream)
    }

    #[inline]
    fn has_pending_write(&self, state: &WsState) -> bool {
        state.has_pending_write()
    }

    fn on_command(&mut self, _: ConnectionId, state: &mut WsState, command: WsCommand) -> Step {
        match command {
            WsCommand::Text(text) => state.queue_frame(OpCode::Text, text.as_bytes()),
            WsCommand::Binary(data) => state.queue_frame(OpCode::Binary, &data),
            WsCommand::Close(code) => state.queue_close(code),
        }

        match state.is_closing() {
            true => Step::Close,
            false => Step::Continue,
        }
    }

    fn on_close(&mut self, id: ConnectionId, state: WsState) {
        let code = state.close_code().unwrap_or(CloseCode::Abnormal);
        self.handler.on_close(id, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ws::frame::FrameHeader, BodyData, Handled, Request, Response, StatusCode};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Handler for Recorder {
        fn handle(&self, _: &Request, _: &BodyData, resp: &mut Response) -> Handled {
            resp.status(StatusCode::NotFound).body("")
        }

        fn on_open(&self, ctx: &mut WsContext) {
            self.events.lock().unwrap().push("open".into());
            ctx.send_text("welcome");
        }

        fn on_message(&self, ctx: &mut WsContext, message: Message) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{message:?}"));

            match message {
                Message::Text("bye") => ctx.close(CloseCode::GoingAway),
                Message::Text(text) => ctx.send_text(&text.to_uppercase()),
                Message::Binary(data) => ctx.send_binary(data),
            }
        }

        fn on_close(&self, _: ConnectionId, code: CloseCode) {
            self.events.lock().unwrap().push(format!("close {}", code.as_u16()));
        }
    }

    fn client_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        FrameHeader {
            mask: Some([1, 2, 3, 4]),
            ..FrameHeader::new(opcode, payload.len() as u64)
        }
        .to_bytes(payload)
    }

    fn server_frames(mut wire: &[u8]) -> Vec<(OpCode, Vec<u8>)> {
        let mut frames = Vec::new();
        while let Some((header, offset)) = FrameHeader::decode(wire) {
            let end = offset + header.payload_len as usize;
            frames.push((header.opcode, wire[offset..end].to_vec()));
            wire = &wire[end..];
        }
        frames
    }

    /// In-memory socket: reads drain `input`, writes accept `budget` bytes.
    struct Duplex {
        input: Vec<u8>,
        output: Vec<u8>,
        budget: usize,
    }

    impl Duplex {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input,
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

    fn setup_with(limits: WsLimits) -> (Arc<Recorder>, WsProtocol<Recorder>, WsState) {
        let handler = Arc::new(Recorder::default());
        let mut proto = WsProtocol::new(handler.clone(), limits);
        let state = proto.open(ConnectionId::nil());
        (handler, proto, state)
    }

    fn setup() -> (Arc<Recorder>, WsProtocol<Recorder>, WsState) {
        setup_with(WsLimits::default())
    }

    #[test]
    fn open_message_and_reply() {
        let (handler, mut proto, mut state) = setup();
        let id = ConnectionId::nil();

        let mut input = client_frame(OpCode::Text, b"hi");
        input.extend(client_frame(OpCode::Binary, &[9, 8]));
        let mut stream = Duplex::new(input);

        assert_eq!(proto.read(id, &mut state, &mut stream), Ok(Step::Continue));
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Continue));

        assert_eq!(
            server_frames(&stream.output),
            [
                (OpCode::Text, b"welcome".to_vec()),
                (OpCode::Text, b"HI".to_vec()),
                (OpCode::Binary, vec![9, 8]),
            ]
        );
        assert_eq!(
            *handler.events.lock().unwrap(),
            ["open", "Text(\"hi\")", "Binary([9, 8])"]
        );
    }

    #[test]
    fn peer_eof_is_reported() {
        let (_, mut proto, mut state) = setup();
        let input = client_frame(OpCode::Text, b"hi");

        assert_eq!(
            proto.read(ConnectionId::nil(), &mut state, &mut input.as_slice()),
            Err(ErrorKind::ConnectionClosed)
        );
    }

    #[test]
    fn application_close_stops_dispatch() {
        let (handler, mut proto, mut state) = setup();
        let id = ConnectionId::nil();

        let mut input = client_frame(OpCode::Text, b"bye");
        input.extend(client_frame(OpCode::Text, b"late"));
        let mut stream = Duplex::new(input);

        assert_eq!(proto.read(id, &mut state, &mut stream), Ok(Step::Close));
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Close));

        let frames = server_frames(&stream.output);
        assert_eq!(frames.last(), Some(&(OpCode::Close, 1001u16.to_be_bytes().to_vec())));

        proto.on_close(id, state);
        assert_eq!(
            *handler.events.lock().unwrap(),
            ["open", "Text(\"bye\")", "close 1001"]
        );
    }

    #[test]
    fn ping_flood_pauses_reading() {
        let (_, mut proto, mut state) = setup_with(WsLimits {
            read_chunk: 262,
            max_pending_write: 300,
            ..WsLimits::default()
        });
        let id = ConnectionId::nil();

        let input: Vec<u8> = (0..50)
            .flat_map(|_| client_frame(OpCode::Ping, &[7; 125]))
            .collect();
        let mut stream = Duplex::new(input);
        stream.budget = 0;

        assert_eq!(proto.read(id, &mut state, &mut stream), Ok(Step::Continue));
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Continue));
        assert!(!stream.input.is_empty());
        assert!(state.pending_bytes() < 300 + 262);

        // One writable event drains the backlog and the rest of the input
        stream.budget = usize::MAX;
        assert_eq!(proto.write(id, &mut state, &mut stream), Ok(Step::Continue));
        assert!(stream.input.is_empty());
        assert_eq!(state.pending_bytes(), 0);

        let frames = server_frames(&stream.output);
        assert_eq!(frames.len(), 1 + 50);
        assert!(frames[1..].iter().all(|frame| *frame == (OpCode::Pong, vec![7; 125])));
    }

    #[test]
    fn commands_queue_frames() {
        let (_, mut proto, mut state) = setup();
        let id = ConnectionId::nil();

        #[rustfmt::skip]
        let steps = [
            (WsCommand::Text("a".into()),              Step::Continue),
            (WsCommand::Binary(vec![1]),                Step::Continue),
            (WsCommand::Close(CloseCode::Normal),       Step::Close),
            (WsCommand::Text("dropped".into()),        Step::Close),
        ];
        for (command, expected) in steps {
            assert_eq!(proto.on_command(id, &mut state, command), expected);
        }

        let mut stream = Duplex::new(Vec::new());
        proto.write(id, &mut state, &mut stream).unwrap();
        assert_eq!(
            server_frames(&stream.output),
            [
                (OpCode::Text, b"welcome".to_vec()),
                (OpCode::Text, b"a".to_vec()),
                (OpCode::Binary, vec![1]),
                (OpCode::Close, 1000u16.to_be_bytes().to_vec()),
            ]
        );
    }

    #[test]
    fn dropped_connection_reports_abnormal() {
        let (handler, mut proto, state) = setup();

        proto.on_close(ConnectionId::nil(), state);
        assert_eq!(handler.events.lock().unwrap().last().unwrap(), "close 1006");
    }
}
