//! Encoder and buffering decoder for frames and messages.

use crate::error::ProtocolError;
use crate::frame::{decode_header, put_header, Frame, FIXHEADER_SIZE};
use crate::message::Message;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a complete frame.
    pub fn encode_message(message: &Message) -> Result<BytesMut, ProtocolError> {
        let payload = message.encode()?;
        Self::encode_payload(&payload)
    }

    /// Frames an already encoded payload.
    pub fn encode_payload(payload: &[u8]) -> Result<BytesMut, ProtocolError> {
        if payload.len() as u64 > MAX_PAYLOAD_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() as u64,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(FIXHEADER_SIZE + payload.len());
        put_header(&mut buf, payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingBody { length: usize },
}

/// Decodes frames from bytes arriving in arbitrary chunks.
///
/// The parsed length prefix is remembered between calls, so feeding one
/// byte at a time produces exactly the frames a single feed would.
pub struct Decoder {
    buffer: BytesMut,
    state: DecodeState,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            state: DecodeState::AwaitingHeader,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.state == DecodeState::AwaitingHeader {
            let Some(header) = decode_header(&self.buffer)? else {
                return Ok(None);
            };
            self.buffer.advance(header.consumed);
            self.state = DecodeState::AwaitingBody {
                length: header.length as usize,
            };
        }

        let DecodeState::AwaitingBody { length } = self.state else {
            return Ok(None);
        };
        if self.buffer.len() < length {
            return Ok(None);
        }

        let payload = self.buffer.split_to(length).freeze();
        self.state = DecodeState::AwaitingHeader;
        Ok(Some(Frame { payload }))
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// A frame whose payload is not a valid message is consumed; the
    /// decoder stays usable for the following frame.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Message::decode(&frame.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Takes `n` unframed bytes (the greeting) from the front of the buffer.
    pub(crate) fn take_raw(&mut self, n: usize) -> Option<Bytes> {
        if self.state != DecodeState::AwaitingHeader || self.buffer.len() < n {
            return None;
        }
        Some(self.buffer.split_to(n).freeze())
    }

    /// Number of payload bytes still needed to finish the current frame,
    /// `None` while the prefix has not been parsed.
    pub fn remaining(&self) -> Option<usize> {
        match self.state {
            DecodeState::AwaitingHeader => None,
            DecodeState::AwaitingBody { length } => Some(length.saturating_sub(self.buffer.len())),
        }
    }

    /// Returns true when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingHeader && self.buffer.is_empty()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer and state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = DecodeState::AwaitingHeader;
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
