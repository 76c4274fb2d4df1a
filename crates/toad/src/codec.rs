//! # codec
//!
//! Byte-level encoding and decoding of WebSocket frames.
//!
//! The [`Decoder`] turns raw bytes into [`Frame`]s, the [`Encoder`] turns
//! [`Frame`]s back into bytes. Both plug into `tokio_util`'s `FramedRead` and
//! `FramedWrite`. Neither knows about messages: fragment assembly lives in
//! [`assemble`](crate::assemble), and ping/close handling in the connection.
//!
//! ```text
//! Network bytes → Decoder → Frame(Text, FIN=0)
//! Network bytes → Decoder → Frame(Ping, FIN=1)          ← handled immediately
//! Network bytes → Decoder → Frame(Continuation, FIN=1)
//!        ↓
//! Reassembler joins Text + Continuation into one message
//! ```
//!
//! Every header check happens as soon as the header is complete, before any
//! payload byte is buffered, so a frame that declares an absurd length is
//! refused without waiting for (or allocating) its payload.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    Error, ProtocolViolation,
    frame::{Frame, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE, OpCode},
    mask::apply_mask,
};

/// Header of a frame whose payload has not fully arrived yet.
struct ReadState {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// Parses frames, keeping partial-frame state between calls.
pub struct Decoder {
    state: Option<ReadState>,
    max_payload_size: usize,
    accept_unmasked: bool,
}

impl Decoder {
    /// Creates a decoder that refuses frames declaring more than
    /// `max_payload_size` bytes. Unmasked frames are refused unless
    /// `accept_unmasked` is set.
    pub fn new(max_payload_size: usize, accept_unmasked: bool) -> Self {
        Self {
            state: None,
            max_payload_size,
            accept_unmasked,
        }
    }

    fn finish(state: ReadState, src: &mut BytesMut) -> Frame {
        if let Some(mask) = state.mask {
            apply_mask(&mut src[..state.payload_len], mask);
        }
        let payload = src.split_to(state.payload_len).freeze();
        Frame::new(state.fin, state.opcode, state.mask, payload)
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(state) = self.state.take() {
            if src.remaining() < state.payload_len {
                src.reserve(state.payload_len - src.remaining());
                self.state = Some(state);
                return Ok(None);
            }
            return Ok(Some(Self::finish(state, src)));
        }

        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        if src[0] & 0b0111_0000 != 0 {
            return Err(ProtocolViolation::ReservedBitsNotZero.into());
        }

        let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + (masked as usize * 4);
        if src.remaining() < header_size {
            return Ok(None);
        }

        src.advance(2);
        let declared: u64 = match extra {
            2 => u64::from(src.get_u16()),
            8 => src.get_u64(),
            _ => u64::from(length_code),
        };
        let mask = masked.then(|| src.get_u32().to_be_bytes());

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolViolation::ControlFrameFragmented.into());
            }
            if declared > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolViolation::ControlFrameTooLarge(declared).into());
            }
        }
        if declared > self.max_payload_size as u64 {
            return Err(Error::PayloadTooLarge {
                length: declared,
                max: self.max_payload_size,
            });
        }
        if mask.is_none() && !self.accept_unmasked {
            return Err(ProtocolViolation::UnmaskedFrame.into());
        }

        // fits in usize: bounded by max_payload_size above
        let payload_len = declared as usize;
        let state = ReadState {
            fin,
            opcode,
            mask,
            payload_len,
        };

        if src.remaining() < payload_len {
            src.reserve(payload_len - src.remaining());
            self.state = Some(state);
            return Ok(None);
        }

        Ok(Some(Self::finish(state, src)))
    }
}

/// Serializes frames, masking the payload when the frame carries a key.
#[derive(Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        if frame.opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
            return Err(Error::ControlPayloadTooLarge {
                length: payload_len,
            });
        }

        dst.reserve(MAX_HEAD_SIZE + payload_len);
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = frame.mask {
            apply_mask(&mut dst[index..], mask);
        }

        Ok(())
    }
}
