//! Per-connection WebSocket parsing state.
//!
//! Bytes are fed in whatever pieces the socket delivers them. The state
//! machine alternates between reading a frame header and reading its
//! payload, reassembles continuation frames, answers control frames and
//! turns every protocol violation into a queued close frame.
//!
//! ```text
//!            header complete & valid
//!   [HEADER] -----------------------> [PAYLOAD]
//!      ^  |                               |
//!      |  | violation                     | payload complete:
//!      |  v                               | unmask, dispatch
//!   [CLOSING] <--- close frame queued ----+
//!      ^                                  |
//!      +---------- back to HEADER <-------+
//! ```

use crate::{
    limits::WsLimits,
    ws::{
        close::CloseCode,
        frame::{apply_mask, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE},
    },
};
use std::{collections::VecDeque, io, mem};

/// A complete message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Incoming {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Payload,
}

#[derive(Debug)]
pub(crate) struct WsState {
    phase: Phase,

    header_buf: [u8; MAX_HEADER_SIZE],
    header_filled: usize,
    header: Option<FrameHeader>,
    payload: Vec<u8>,

    // First frame of an unfinished fragmented message
    primary: Option<FrameHeader>,
    fragments: Vec<Vec<u8>>,
    fragments_len: usize,

    closing: bool,
    close_code: Option<CloseCode>,

    outbound: VecDeque<Vec<u8>>,
    queued: usize,
    written: usize,
    read_paused: bool,
}

impl WsState {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Header,

            header_buf: [0; MAX_HEADER_SIZE],
            header_filled: 0,
            header: None,
            payload: Vec::new(),

            primary: None,
            fragments: Vec::new(),
            fragments_len: 0,

            closing: false,
            close_code: None,

            outbound: VecDeque::new(),
            queued: 0,
            written: 0,
            read_paused: false,
        }
    }

    /// `true` once a close frame has been queued. No further input is
    /// processed and no further frames are queued.
    #[inline]
    pub(crate) const fn is_closing(&self) -> bool {
        self.closing
    }

    /// Close code received from the peer, or the one sent on a violation.
    #[inline]
    pub(crate) const fn close_code(&self) -> Option<CloseCode> {
        self.close_code
    }

    #[inline]
    pub(crate) fn has_pending_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Bytes queued for the peer and not yet written.
    #[inline]
    pub(crate) const fn pending_bytes(&self) -> usize {
        self.queued - self.written
    }

    /// Marks that input was left unread because the outbound queue is full.
    #[inline]
    pub(crate) fn pause_reading(&mut self) {
        self.read_paused = true;
    }

    /// Clears the pause mark, returning whether it was set.
    #[inline]
    pub(crate) fn resume_reading(&mut self) -> bool {
        mem::take(&mut self.read_paused)
    }

    /// Consumes `input`, pushing every completed message to `messages`.
    pub(crate) fn feed(&mut self, mut input: &[u8], limits: &WsLimits, messages: &mut Vec<Incoming>) {
        while !self.closing {
            match self.phase {
                Phase::Header => {
                    let wanted = match self.header_filled < 2 {
                        true => 2,
                        false => FrameHeader::size_hint(self.header_buf[1]),
                    };

                    if self.header_filled < wanted {
                        if input.is_empty() {
                            return;
                        }

                        let take = (wanted - self.header_filled).min(input.len());
                        self.header_buf[self.header_filled..self.header_filled + take]
                            .copy_from_slice(&input[..take]);
                        self.header_filled += take;
                        input = &input[take..];
                        continue;
                    }

                    let Some((header, _)) = FrameHeader::decode(&self.header_buf[..self.header_filled])
                    else {
                        self.fail(CloseCode::ProtocolError);
                        return;
                    };
                    self.header_filled = 0;

                    if let Err(code) = self.validate(&header, limits) {
                        self.fail(code);
                        return;
                    }

                    // Grows as bytes arrive, the declared length is untrusted
                    self.payload = Vec::with_capacity((header.payload_len as usize).min(limits.read_chunk));
                    self.header = Some(header);
                    self.phase = Phase::Payload;
                }
                Phase::Payload => {
                    let Some(header) = self.header else {
                        self.phase = Phase::Header;
                        continue;
                    };

                    let missing = header.payload_len as usize - self.payload.len();
                    if missing > 0 {
                        if input.is_empty() {
                            return;
                        }

                        let take = missing.min(input.len());
                        self.payload.extend_from_slice(&input[..take]);
                        input = &input[take..];
                        continue;
                    }

                    let mut payload = mem::take(&mut self.payload);
                    if let Some(key) = header.mask {
                        apply_mask(&mut payload, key);
                    }

                    self.header = None;
                    self.phase = Phase::Header;
                    self.on_frame(header, payload, limits, messages);
                }
            }
        }
    }

    fn validate(&self, header: &FrameHeader, limits: &WsLimits) -> Result<(), CloseCode> {
        if !header.is_masked() || header.has_reserved_bits() || header.opcode.is_reserved() {
            return Err(CloseCode::ProtocolError);
        }

        if header.opcode.is_control() {
            if !header.fin || header.payload_len > MAX_CONTROL_PAYLOAD {
                return Err(CloseCode::ProtocolError);
            }
            return Ok(());
        }

        if header.payload_len > limits.max_payload_size {
            return Err(CloseCode::MessageTooBig);
        }

        match (header.opcode, self.primary.is_some()) {
            (OpCode::Continuation, false) => Err(CloseCode::ProtocolError),
            (OpCode::Text | OpCode::Binary, true) => Err(CloseCode::ProtocolError),
            _ if self.fragments_len as u64 + header.payload_len
                > limits.max_message_size as u64 =>
            {
                Err(CloseCode::MessageTooBig)
            }
            _ => Ok(()),
        }
    }

    fn on_frame(
        &mut self,
        header: FrameHeader,
        payload: Vec<u8>,
        limits: &WsLimits,
        messages: &mut Vec<Incoming>,
    ) {
        match header.opcode {
            OpCode::Ping => self.queue_frame(OpCode::Pong, &payload),
            OpCode::Pong => {}
            OpCode::Close => {
                let received = match payload.as_slice() {
                    [] => CloseCode::Normal,
                    [_] => CloseCode::ProtocolError,
                    [hi, lo, ..] => match CloseCode::from_u16(u16::from_be_bytes([*hi, *lo])) {
                        code if code.is_reserved() => CloseCode::ProtocolError,
                        code => code,
                    },
                };

                self.close_code = Some(received);
                self.queue_close(CloseCode::Normal);
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let primary = match header.opcode {
                    OpCode::Continuation => self.primary.map(|p| p.opcode),
                    opcode => Some(opcode),
                };

                if !header.fin {
                    if self.primary.is_none() {
                        self.primary = Some(header);
                    }
                    self.fragments_len += payload.len();
                    self.fragments.push(payload);
                    return;
                }

                let data = match self.fragments.is_empty() {
                    true => payload,
                    false => {
                        let mut data = Vec::with_capacity(self.fragments_len + payload.len());
                        for fragment in self.fragments.drain(..) {
                            data.extend_from_slice(&fragment);
                        }
                        data.extend_from_slice(&payload);
                        data
                    }
                };
                self.primary = None;
                self.fragments_len = 0;

                match primary {
                    Some(OpCode::Text) => match simdutf8::basic::from_utf8(&data) {
                        // SAFETY: validated as UTF-8 just above
                        Ok(_) => messages.push(Incoming::Text(unsafe {
                            String::from_utf8_unchecked(data)
                        })),
                        Err(_) => self.fail(CloseCode::InconsistentData),
                    },
                    _ => messages.push(Incoming::Binary(data)),
                }
            }
            // Rejected by `validate`
            OpCode::Reserved(_) => self.fail(CloseCode::ProtocolError),
        }

        debug_assert!(self.fragments_len <= limits.max_message_size);
    }

    fn fail(&mut self, code: CloseCode) {
        self.close_code = Some(code);
        self.queue_close(code);
    }

    /// Queues one unmasked, final frame. Ignored once closing.
    pub(crate) fn queue_frame(&mut self, opcode: OpCode, payload: &[u8]) {
        if self.closing {
            return;
        }

        let frame = FrameHeader::new(opcode, payload.len() as u64).to_bytes(payload);
        self.queued += frame.len();
        self.outbound.push_back(frame);
    }

    /// Queues a close frame and stops processing input.
    pub(crate) fn queue_close(&mut self, code: CloseCode) {
        if self.closing {
            return;
        }

        self.queue_frame(OpCode::Close, &code.as_u16().to_be_bytes());
        self.close_code.get_or_insert(code);
        self.closing = true;

        self.payload = Vec::new();
        self.header = None;
        self.primary = None;
        self.fragments.clear();
        self.fragments_len = 0;
    }

    /// Writes queued frames in FIFO order until the writer would block.
    ///
    /// Returns `true` when the queue is empty.
    pub(crate) fn flush<W: io::Write>(&mut self, w: &mut W) -> io::Result<bool> {
        while let Some(front) = self.outbound.front() {
            if !crate::server::reactor::write_buf(w, front, &mut self.written)? {
                return Ok(false);
            }

            self.queued -= front.len();
            self.outbound.pop_front();
            self.written = 0;
        }

        Ok(true)
    }
}
