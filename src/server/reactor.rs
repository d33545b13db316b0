//! Selector loop shared by every protocol handler.
//!
//! Each [`Reactor`] owns one `mio::Poll` and runs on its own OS thread.
//! Sockets reach it through a [`Registrar`] from any other thread; the
//! registrar queues the socket and wakes the poll so the new interest is
//! observed on the next iteration.
//!
//! Connection lifecycle:
//! ```text
//!  REGISTERED -> (READING <-> WRITING)* -> REMOVING -> CLOSED
//!                                              |
//!                                              +----> hand-off to another Reactor
//! ```
//! `REMOVING` stops reads immediately; the socket is closed (or handed off)
//! at the end of a loop iteration once its pending writes have drained.
//! I/O faults and panics skip the drain and close at once.

use crate::{
    errors::ErrorKind,
    server::connection::{ConnectionId, HandlerKind},
};
use crossbeam::queue::SegQueue;
use mio::{net::TcpStream, Events, Interest, Poll, Token, Waker};
use std::{
    collections::HashMap,
    io::{self, Read, Write},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const WAKER: Token = Token(0);
const DISCARD_LIMIT: usize = 64 * 1024;

/// What the reactor should do with a connection after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// Close once pending writes have drained.
    Close,
    /// Move the socket to another handler once pending writes have drained.
    Handoff(HandlerKind),
}

/// Protocol-specific half of a reactor.
///
/// All methods run on the reactor thread. Errors and panics returned from
/// them remove the connection immediately.
pub(crate) trait Protocol: Send + 'static {
    /// Per-connection state, created on registration and dropped on removal.
    type State: Send;
    /// Work queued for a connection from another thread.
    type Command: Send + 'static;

    const KIND: HandlerKind;

    fn open(&mut self, id: ConnectionId) -> Self::State;

    fn on_read(
        &mut self,
        id: ConnectionId,
        state: &mut Self::State,
        stream: &mut TcpStream,
    ) -> Result<Step, ErrorKind>;

    fn on_write(
        &mut self,
        id: ConnectionId,
        state: &mut Self::State,
        stream: &mut TcpStream,
    ) -> Result<Step, ErrorKind>;

    fn has_pending_write(&self, state: &Self::State) -> bool;

    fn on_command(&mut self, id: ConnectionId, state: &mut Self::State, command: Self::Command) -> Step;

    /// Called exactly once when the socket is closed. Not called on hand-off.
    fn on_close(&mut self, id: ConnectionId, state: Self::State);
}

/// Thread-safe entry point into a reactor.
#[derive(Clone)]
pub(crate) struct Registrar {
    queue: Arc<SegQueue<(TcpStream, ConnectionId)>>,
    waker: Arc<Waker>,
}

impl Registrar {
    /// Queues `stream` for registration and wakes the reactor.
    pub(crate) fn register(&self, stream: TcpStream, id: ConnectionId) -> io::Result<()> {
        self.queue.push((stream, id));
        self.waker.wake()
    }
}

/// Sends commands to connections owned by a reactor.
pub(crate) struct Commands<C> {
    queue: Arc<SegQueue<(ConnectionId, C)>>,
    waker: Arc<Waker>,
}

impl<C> Clone for Commands<C> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<C> Commands<C> {
    pub(crate) fn push(&self, id: ConnectionId, command: C) -> io::Result<()> {
        self.queue.push((id, command));
        self.waker.wake()
    }
}

/// Resolves hand-off targets.
#[derive(Clone)]
pub(crate) struct Registry {
    http: Registrar,
    websocket: Registrar,
}

impl Registry {
    pub(crate) fn new(http: Registrar, websocket: Registrar) -> Self {
        Self { http, websocket }
    }

    #[inline]
    pub(crate) fn get(&self, kind: HandlerKind) -> &Registrar {
        match kind {
            HandlerKind::Http => &self.http,
            HandlerKind::WebSocket => &self.websocket,
        }
    }
}

struct Entry<S> {
    stream: TcpStream,
    token: Token,
    state: S,
    removing: Option<Step>,
}

pub(crate) struct Reactor<P: Protocol> {
    poll: Poll,
    protocol: P,

    incoming: Arc<SegQueue<(TcpStream, ConnectionId)>>,
    commands: Arc<SegQueue<(ConnectionId, P::Command)>>,
    waker: Arc<Waker>,
    registry: Option<Registry>,

    tokens: HashMap<Token, ConnectionId>,
    conns: HashMap<ConnectionId, Entry<P::State>>,
    next_token: usize,

    alive: Arc<AtomicUsize>,
    events_capacity: usize,
}

impl<P: Protocol> Reactor<P> {
    pub(crate) fn new(protocol: P, alive: Arc<AtomicUsize>, events_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(Self {
            poll,
            protocol,

            incoming: Arc::new(SegQueue::new()),
            commands: Arc::new(SegQueue::new()),
            waker,
            registry: None,

            tokens: HashMap::new(),
            conns: HashMap::new(),
            next_token: 1,

            alive,
            events_capacity: events_capacity.max(1),
        })
    }

    pub(crate) fn registrar(&self) -> Registrar {
        Registrar {
            queue: self.incoming.clone(),
            waker: self.waker.clone(),
        }
    }

    pub(crate) fn commands(&self) -> Commands<P::Command> {
        Commands {
            queue: self.commands.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Must be called before [`run`](Self::run) for hand-offs to work.
    pub(crate) fn set_registry(&mut self, registry: Registry) {
        self.registry = Some(registry);
    }

    /// Runs the loop until the selector itself fails.
    pub(crate) fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        loop {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(handler = ?P::KIND, error = %err, "Selector failed");
                return Err(err);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    token => self.ready(
                        token,
                        event.is_readable() || event.is_read_closed() || event.is_error(),
                        event.is_writable(),
                    ),
                }
            }

            // Wake-ups are coalesced, so the queues are drained every iteration
            self.accept_incoming();
            self.apply_commands();
            self.sweep();
        }
    }

    fn accept_incoming(&mut self) {
        while let Some((mut stream, id)) = self.incoming.pop() {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1).max(1);

            if let Err(err) =
                self.poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            {
                tracing::error!(%id, handler = ?P::KIND, error = %err, "Registration failed");
                self.alive.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            let protocol = &mut self.protocol;
            let state = match catch_unwind(AssertUnwindSafe(|| protocol.open(id))) {
                Ok(state) => state,
                Err(_) => {
                    tracing::error!(%id, handler = ?P::KIND, "Panic while opening connection");
                    let _ = self.poll.registry().deregister(&mut stream);
                    self.alive.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
            };

            tracing::debug!(%id, handler = ?P::KIND, "Connection registered");
            self.tokens.insert(token, id);
            self.conns.insert(
                id,
                Entry {
                    stream,
                    token,
                    state,
                    removing: None,
                },
            );

            // `open` may already have queued output
            self.drive(id, false, true);
        }
    }

    fn apply_commands(&mut self) {
        while let Some((id, command)) = self.commands.pop() {
            let Some(entry) = self.conns.get_mut(&id) else {
                tracing::trace!(%id, "Command for unknown connection dropped");
                continue;
            };

            if entry.removing.is_some() {
                continue;
            }

            let protocol = &mut self.protocol;
            let state = &mut entry.state;
            match catch_unwind(AssertUnwindSafe(|| protocol.on_command(id, state, command))) {
                Ok(Step::Continue) => {}
                Ok(step) => entry.removing = Some(step),
                Err(_) => {
                    tracing::error!(%id, handler = ?P::KIND, "Panic while applying command");
                    self.remove(id, Step::Close);
                    continue;
                }
            }

            self.drive(id, false, true);
        }
    }

    fn ready(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(&id) = self.tokens.get(&token) else {
            // Removed earlier in this batch
            return;
        };

        self.drive(id, readable, writable);
    }

    /// Runs the read and write callbacks for one connection.
    fn drive(&mut self, id: ConnectionId, readable: bool, writable: bool) {
        let Some(entry) = self.conns.get_mut(&id) else {
            return;
        };
        let protocol = &mut self.protocol;

        let result = catch_unwind(AssertUnwindSafe(|| -> Result<(), ErrorKind> {
            if readable && entry.removing.is_none() {
                match protocol.on_read(id, &mut entry.state, &mut entry.stream)? {
                    Step::Continue => {}
                    step => entry.removing = Some(step),
                }
            }

            // Edge-triggered: output produced by a read is written right away
            if writable || protocol.has_pending_write(&entry.state) {
                match protocol.on_write(id, &mut entry.state, &mut entry.stream)? {
                    Step::Continue => {}
                    step => {
                        entry.removing.get_or_insert(step);
                    }
                }
            }

            Ok(())
        }));

        match result {
            Ok(Ok(())) => {}
            Ok(Err(ErrorKind::ConnectionClosed)) => {
                tracing::debug!(%id, handler = ?P::KIND, "Peer closed the connection");
                self.remove(id, Step::Close);
            }
            Ok(Err(err)) if err.is_parse_error() => {
                tracing::warn!(%id, handler = ?P::KIND, error = %err, "Malformed input, connection dropped");
                self.remove(id, Step::Close);
            }
            Ok(Err(err)) => {
                tracing::debug!(%id, handler = ?P::KIND, error = %err, "I/O fault, connection dropped");
                self.remove(id, Step::Close);
            }
            Err(_) => {
                tracing::error!(%id, handler = ?P::KIND, "Panic in connection handler");
                self.remove(id, Step::Close);
            }
        }
    }

    /// Finishes every removal whose output has drained.
    fn sweep(&mut self) {
        let ready: Vec<_> = self
            .conns
            .iter()
            .filter_map(|(id, entry)| {
                let step = entry.removing?;
                (!self.protocol.has_pending_write(&entry.state)).then_some((*id, step))
            })
            .collect();

        for (id, step) in ready {
            self.remove(id, step);
        }
    }

    /// Retires `id`. Runs at most once per connection.
    fn remove(&mut self, id: ConnectionId, step: Step) {
        let Some(mut entry) = self.conns.remove(&id) else {
            return;
        };
        self.tokens.remove(&entry.token);

        if let Err(err) = self.poll.registry().deregister(&mut entry.stream) {
            tracing::warn!(%id, error = %err, "Deregister failed");
        }

        match (step, &self.registry) {
            (Step::Handoff(kind), Some(registry)) if kind != P::KIND => {
                // Old state is dropped before the target sees the socket
                drop(entry.state);

                tracing::debug!(%id, from = ?P::KIND, to = ?kind, "Connection handed off");
                if let Err(err) = registry.get(kind).register(entry.stream, id) {
                    tracing::error!(%id, error = %err, "Hand-off wake failed");
                }
            }
            _ => {
                let protocol = &mut self.protocol;
                let state = entry.state;
                if catch_unwind(AssertUnwindSafe(|| protocol.on_close(id, state))).is_err() {
                    tracing::error!(%id, handler = ?P::KIND, "Panic while closing connection");
                }

                // Unread input at close() makes the kernel send a reset, which
                // can destroy response bytes the peer has not read yet
                let _ = entry.stream.shutdown(std::net::Shutdown::Write);
                discard_input(&mut entry.stream);
                self.alive.fetch_sub(1, Ordering::AcqRel);
                tracing::debug!(%id, handler = ?P::KIND, "Connection closed");
            }
        }
    }
}

/// Writes `buf[*pos..]` until done or the writer would block.
///
/// Returns `true` once the whole buffer is written.
pub(crate) fn write_buf<W: Write>(w: &mut W, buf: &[u8], pos: &mut usize) -> io::Result<bool> {
    while *pos < buf.len() {
        match w.write(&buf[*pos..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *pos += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    Ok(true)
}

/// Reads and drops whatever the peer has already sent, at most
/// `DISCARD_LIMIT` bytes. Input arriving after this still resets the socket.
pub(crate) fn discard_input<R: Read>(r: &mut R) {
    let mut buf = [0; 4096];
    let mut left = DISCARD_LIMIT;

    while left > 0 {
        match r.read(&mut buf[..left.min(4096)]) {
            Ok(0) => return,
            Ok(n) => left -= n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}

/// Appends at most `chunk` bytes from `r` to `buf`.
///
/// Returns `false` when the reader would block, and
/// [`ErrorKind::ConnectionClosed`] at end of stream.
pub(crate) fn read_chunk<R: Read>(r: &mut R, buf: &mut Vec<u8>, chunk: usize) -> Result<bool, ErrorKind> {
    let start = buf.len();
    buf.resize(start + chunk.max(1), 0);

    let result = loop {
        match r.read(&mut buf[start..]) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            other => break other,
        }
    };

    match result {
        Ok(0) => {
            buf.truncate(start);
            Err(ErrorKind::ConnectionClosed)
        }
        Ok(n) => {
            buf.truncate(start + n);
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            buf.truncate(start);
            Ok(false)
        }
        Err(err) => {
            buf.truncate(start);
            Err(err.into())
        }
    }
}
