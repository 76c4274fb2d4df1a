//! Reassembly of fragmented messages.
//!
//! A message is a text or binary frame followed by zero or more continuation
//! frames, the last of which has FIN set. Control frames may be interleaved
//! between fragments; they are handled by the connection and never reach the
//! [`Reassembler`].

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Error, ProtocolViolation, Result,
    frame::{Frame, OpCode},
    message::{Message, MessageKind},
};

struct Fragments {
    kind: MessageKind,
    bytes_read: usize,
    parts: VecDeque<Bytes>,
}

/// Per-connection accumulator of message fragments.
///
/// Holds at most one in-progress message. After a message completes or an
/// error is returned, the accumulator is empty again.
pub struct Reassembler {
    pending: Option<Fragments>,
    max_message_size: usize,
}

impl Reassembler {
    /// Creates a reassembler that refuses messages whose total payload
    /// exceeds `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: None,
            max_message_size,
        }
    }

    /// Returns `true` while a fragmented message is waiting for its final frame.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Feeds one data frame.
    ///
    /// Returns `Ok(Some(message))` once a message is complete, `Ok(None)` while
    /// fragments are still expected. Control frames are ignored.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode() {
            OpCode::Text | OpCode::Binary => {
                if self.pending.take().is_some() {
                    return Err(ProtocolViolation::ExpectedContinuation.into());
                }

                let kind = if frame.opcode() == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };

                if frame.is_fin() {
                    return build(kind, frame.into_payload()).map(Some);
                }

                let payload = frame.into_payload();
                self.check_size(payload.len())?;
                self.pending = Some(Fragments {
                    kind,
                    bytes_read: payload.len(),
                    parts: VecDeque::from([payload]),
                });
                Ok(None)
            }
            OpCode::Continuation => {
                let mut fragments = self
                    .pending
                    .take()
                    .ok_or(ProtocolViolation::UnexpectedContinuation)?;

                let fin = frame.is_fin();
                let payload = frame.into_payload();
                fragments.bytes_read = fragments.bytes_read.saturating_add(payload.len());
                self.check_size(fragments.bytes_read)?;
                fragments.parts.push_back(payload);

                if !fin {
                    self.pending = Some(fragments);
                    return Ok(None);
                }

                let payload = fragments
                    .parts
                    .into_iter()
                    .fold(
                        BytesMut::with_capacity(fragments.bytes_read),
                        |mut acc, part| {
                            acc.put(part);
                            acc
                        },
                    )
                    .freeze();
                build(fragments.kind, payload).map(Some)
            }
            OpCode::Close | OpCode::Ping | OpCode::Pong => Ok(None),
        }
    }

    fn check_size(&self, length: usize) -> Result<()> {
        if length > self.max_message_size {
            return Err(Error::PayloadTooLarge {
                length: length as u64,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn build(kind: MessageKind, payload: Bytes) -> Result<Message> {
    match kind {
        MessageKind::Binary => Ok(Message::Binary(payload)),
        MessageKind::Text => String::from_utf8(payload.to_vec())
            .map(Message::Text)
            .map_err(|_| ProtocolViolation::InvalidUtf8.into()),
    }
}
