//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! A [`Frame`] always holds its payload *unmasked*. The mask key, when set,
//! is applied by the [`Encoder`](crate::codec::Encoder) on the way out and
//! removed by the [`Decoder`](crate::codec::Decoder) on the way in.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{ProtocolViolation, close::CloseCode};

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible frame header: 2 bytes, 8 bytes of extended length, 4 bytes of mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code.
///
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames are never fragmented, carry at most 125 payload bytes and
    /// are handled as soon as they arrive, even in the middle of a fragmented
    /// message.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolViolation;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(ProtocolViolation::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// One wire-level WebSocket frame.
///
/// Frames are transient: the decoder builds one per frame read, the writer
/// consumes one per frame sent.
///
/// ```rust
/// use toad::{CloseCode, Frame, OpCode};
///
/// let text = Frame::text("Hello");
/// let ping = Frame::ping(vec![1, 2, 3]);
/// let close = Frame::close(CloseCode::Normal, "bye");
///
/// // Fragmented message
/// let first = Frame::text("Hel").with_fin(false);
/// let last = Frame::continuation("lo");
/// assert_eq!(last.opcode(), OpCode::Continuation);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub(crate) fin: bool,
    pub(crate) opcode: OpCode,
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Low-level constructor.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Final continuation frame. Use [`with_fin(false)`](Self::with_fin) for middle fragments.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Close frame carrying a status code and a reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(u16::from(code));
        payload.put_slice(reason);
        Self::new(true, OpCode::Close, None, payload.freeze())
    }

    /// Close frame with an arbitrary payload (possibly empty).
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets an explicit masking key.
    #[must_use]
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Sets a freshly generated masking key.
    ///
    /// The key comes straight from the RNG; an all-zero key is possible and
    /// is not retried, since RFC 6455 does not forbid it.
    #[must_use]
    pub fn with_random_mask(mut self) -> Self {
        self.mask = Some(rand::random());
        self
    }

    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    /// The masking key this frame was received with, or will be sent with.
    #[inline(always)]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// The unmasked payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline(always)]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<CloseCode> {
        let bytes = self.payload.get(0..2)?;
        Some(CloseCode::from(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    /// Splits a data frame into fragments carrying at most `max_size` bytes
    /// each. The first fragment keeps the opcode, the rest are continuations,
    /// and only the last one has FIN set. A frame that already fits is yielded
    /// unchanged.
    pub fn into_fragments(self, max_size: usize) -> impl Iterator<Item = Frame> {
        struct Split {
            index: usize,
            max_size: usize,
            frame: Option<Frame>,
        }

        impl Iterator for Split {
            type Item = Frame;

            fn next(&mut self) -> Option<Self::Item> {
                let mut frame = self.frame.take()?;
                if frame.payload.len() <= self.max_size {
                    if self.index != 0 {
                        frame.fin = true;
                        frame.opcode = OpCode::Continuation;
                    }
                    Some(frame)
                } else {
                    let opcode = if self.index == 0 {
                        frame.opcode
                    } else {
                        OpCode::Continuation
                    };
                    self.index += 1;
                    let chunk = frame.payload.split_to(self.max_size);
                    let mask = frame.mask;
                    self.frame = Some(frame);
                    Some(Frame::new(false, opcode, mask, chunk))
                }
            }
        }

        Split {
            index: 0,
            max_size: max_size.max(1),
            frame: Some(self),
        }
    }

    /// Writes the header using the smallest length encoding that fits.
    pub(crate) fn write_head(&self, dst: &mut BytesMut) {
        let first_byte = (self.fin as u8) << 7 | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first_byte);
        if len < 126 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len < 65536 {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }
}
