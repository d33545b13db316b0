//! WebSocket frame header codec ([RFC 6455, Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2)).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! ```

/// Longest possible header: 2 + 8 (extended length) + 4 (masking key).
pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// Largest payload a control frame may carry.
pub(crate) const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// `0x3..=0x7` and `0xB..=0xF`, never valid on the wire.
    Reserved(u8),
}

impl OpCode {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    #[inline]
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(value) => *value & 0x0F,
        }
    }

    /// Close, Ping and Pong (and reserved `0xB..=0xF`).
    #[inline]
    pub const fn is_control(&self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    #[inline]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved(_))
    }
}

/// Header of one WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: OpCode,
    /// Payload length, at most `i64::MAX`.
    pub payload_len: u64,
    /// Present iff the mask bit is set.
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Header of a single, unmasked, final frame as the server sends it.
    #[inline]
    pub const fn new(opcode: OpCode, payload_len: u64) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload_len,
            mask: None,
        }
    }

    #[inline]
    pub const fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    #[inline]
    pub const fn has_reserved_bits(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Decodes a header from the front of `buf`.
    ///
    /// Returns `None` while `buf` is too short for the next field; call again
    /// with the same bytes plus whatever arrived since. On success returns the
    /// header and its size, i.e. the offset of the first payload byte.
    ///
    /// # Examples
    /// ```
    /// use maker_ws::{FrameHeader, OpCode};
    ///
    /// let frame = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
    ///
    /// assert_eq!(FrameHeader::decode(&frame[..1]), None);
    ///
    /// let (header, offset) = FrameHeader::decode(&frame).unwrap();
    /// assert!(header.fin);
    /// assert_eq!(header.opcode, OpCode::Text);
    /// assert_eq!(header.payload_len, 5);
    /// assert_eq!(&frame[offset..], b"Hello");
    /// ```
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let (&b0, &b1) = (buf.first()?, buf.get(1)?);

        let (payload_len, len_end) = match b1 & 0x7F {
            126 => {
                let ext: [u8; 2] = buf.get(2..4)?.try_into().ok()?;
                (u16::from_be_bytes(ext) as u64, 4)
            }
            127 => {
                let ext: [u8; 8] = buf.get(2..10)?.try_into().ok()?;
                (u64::from_be_bytes(ext) & 0x7FFF_FFFF_FFFF_FFFF, 10)
            }
            len => (len as u64, 2),
        };

        let (mask, end) = match b1 & 0x80 != 0 {
            true => {
                let key: [u8; 4] = buf.get(len_end..len_end + 4)?.try_into().ok()?;
                (Some(key), len_end + 4)
            }
            false => (None, len_end),
        };

        Some((
            Self {
                fin: b0 & 0x80 != 0,
                rsv1: b0 & 0x40 != 0,
                rsv2: b0 & 0x20 != 0,
                rsv3: b0 & 0x10 != 0,
                opcode: OpCode::from_u8(b0),
                payload_len,
                mask,
            },
            end,
        ))
    }

    /// Total header size announced by the first two bytes.
    #[inline]
    pub(crate) const fn size_hint(b1: u8) -> usize {
        let len = match b1 & 0x7F {
            126 => 4,
            127 => 10,
            _ => 2,
        };
        match b1 & 0x80 != 0 {
            true => len + 4,
            false => len,
        }
    }

    /// Appends the header bytes to `out`.
    ///
    /// The length class is picked from `payload_len`: up to 125 inline,
    /// up to 65535 as `126` plus 2 bytes, anything else as `127` plus 8 bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let b0 = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | self.opcode.as_u8();
        let mask_bit = (self.mask.is_some() as u8) << 7;

        out.push(b0);
        match self.payload_len {
            len @ 0..=125 => out.push(mask_bit | len as u8),
            len @ 126..=0xFFFF => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(len & 0x7FFF_FFFF_FFFF_FFFF).to_be_bytes());
            }
        }

        if let Some(key) = self.mask {
            out.extend_from_slice(&key);
        }
    }

    /// Encodes a whole frame: header followed by the payload, masked when
    /// the header carries a masking key.
    pub fn to_bytes(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert_eq!(self.payload_len, payload.len() as u64);

        let mut out = Vec::with_capacity(MAX_HEADER_SIZE + payload.len());
        self.encode(&mut out);

        let start = out.len();
        out.extend_from_slice(payload);
        if let Some(key) = self.mask {
            apply_mask(&mut out[start..], key);
        }

        out
    }
}

/// XORs every byte with `key[i % 4]`. Applying it twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}
