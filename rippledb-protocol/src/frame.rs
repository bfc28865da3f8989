//! Length-prefixed frame format.
//!
//! Every frame is a MessagePack unsigned integer holding the payload length,
//! followed by exactly that many payload bytes:
//!
//! ```text
//! +-----------------------------+---------------------+
//! | length (msgpack uint)       | payload             |
//! | 1, 2, 3, 5 or 9 bytes       | length bytes        |
//! +-----------------------------+---------------------+
//! ```
//!
//! The encoder always writes the 5-byte `uint32` form. Decoders accept every
//! unsigned width so peers may use the compact forms.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmp::Marker;

/// Size of the length prefix as written by this implementation.
pub const FIXHEADER_SIZE: usize = 5;

/// Largest possible length prefix (`uint64` marker plus 8 bytes).
pub const MAX_PREFIX_SIZE: usize = 9;

/// A decoded length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub length: u32,
    /// Number of prefix bytes consumed.
    pub consumed: usize,
}

/// Decodes the length prefix at the start of `buf`.
///
/// Returns `Ok(None)` while the prefix is incomplete. Only the marker byte
/// and its width are inspected, so a caller polling a non-blocking socket can
/// stop as soon as this returns `None`.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };

    let width = match Marker::from_u8(marker) {
        Marker::FixPos(n) => {
            return Ok(Some(FrameHeader {
                length: n as u32,
                consumed: 1,
            }))
        }
        Marker::U8 => 1,
        Marker::U16 => 2,
        Marker::U32 => 4,
        Marker::U64 => 8,
        _ => return Err(ProtocolError::InvalidLengthPrefix(marker)),
    };

    if buf.len() < 1 + width {
        return Ok(None);
    }

    let mut raw = &buf[1..1 + width];
    let length = match width {
        1 => raw.get_u8() as u64,
        2 => raw.get_u16() as u64,
        4 => raw.get_u32() as u64,
        _ => raw.get_u64(),
    };

    if length > MAX_PAYLOAD_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    Ok(Some(FrameHeader {
        length: length as u32,
        consumed: 1 + width,
    }))
}

/// Writes the 5-byte length prefix for `length`.
pub fn put_header(buf: &mut BytesMut, length: u32) {
    buf.put_u8(Marker::U32.to_u8());
    buf.put_u32(length);
}

/// A single length-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame payload (one encoded message).
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len() as u64;
        if len > MAX_PAYLOAD_SIZE as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FIXHEADER_SIZE + self.payload.len());
        put_header(&mut buf, len as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on a bad prefix. Nothing
    /// is consumed unless a whole frame is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(header) = decode_header(buf)? else {
            return Ok(None);
        };

        let total = header.consumed + header.length as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(header.consumed);
        let payload = buf.split_to(header.length as usize).freeze();
        Ok(Some(Self { payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new(&b"\x81\x00\x40\x80"[..]);
        let mut buf = frame.encode().unwrap();

        assert_eq!(buf.len(), FIXHEADER_SIZE + 4);
        assert_eq!(buf[0], 0xce);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_header_accepts_every_uint_width() {
        let cases: [(&[u8], u32, usize); 5] = [
            (&[0x05], 5, 1),
            (&[0xcc, 0xc8], 200, 2),
            (&[0xcd, 0x01, 0x00], 256, 3),
            (&[0xce, 0x00, 0x01, 0x00, 0x00], 65536, 5),
            (&[0xcf, 0, 0, 0, 0, 0, 0, 0, 7], 7, 9),
        ];
        for (bytes, length, consumed) in cases {
            let header = decode_header(bytes).unwrap().unwrap();
            assert_eq!(header, FrameHeader { length, consumed });
        }
    }

    #[test]
    fn test_decode_header_incomplete() {
        assert!(decode_header(&[]).unwrap().is_none());
        assert!(decode_header(&[0xce, 0x00, 0x00]).unwrap().is_none());
        assert!(decode_header(&[0xcf, 0x00]).unwrap().is_none());
    }

    #[test]
    fn test_decode_header_rejects_non_uint_marker() {
        // fixstr, negative fixint and fixmap are all invalid prefixes
        for marker in [0xa3u8, 0xff, 0x81, 0xc0] {
            let result = decode_header(&[marker, 0, 0, 0, 0]);
            assert!(matches!(
                result,
                Err(ProtocolError::InvalidLengthPrefix(m)) if m == marker
            ));
        }
    }

    #[test]
    fn test_decode_header_rejects_oversized_length() {
        let result = decode_header(&[0xcf, 0xff, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_frame_too_large() {
        let huge_payload = vec![0u8; (MAX_PAYLOAD_SIZE + 1) as usize];
        let frame = Frame::new(huge_payload);
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_incomplete_payload_consumes_nothing() {
        let mut buf = BytesMut::from(&b"\xce\x00\x00\x00\x04\x01\x02"[..]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn test_compact_prefix_frame() {
        let mut buf = BytesMut::from(&b"\x02\x80\x80rest"[..]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"\x80\x80");
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::new(&b"one"[..]).encode().unwrap());
        buf.extend_from_slice(&Frame::new(&b"two"[..]).encode().unwrap());

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert_eq!(&second.payload[..], b"two");
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = Frame::new(Bytes::new()).encode().unwrap();
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let frame = Frame::new(payload.clone());
            let mut buf = frame.encode().unwrap();
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(&decoded.payload[..], &payload[..]);
        }

        #[test]
        fn prop_rmp_written_lengths_decode(len in 0u64..(MAX_PAYLOAD_SIZE as u64)) {
            let mut prefix = Vec::new();
            rmp::encode::write_uint(&mut prefix, len).unwrap();
            let header = decode_header(&prefix).unwrap().unwrap();
            prop_assert_eq!(header.length as u64, len);
            prop_assert_eq!(header.consumed, prefix.len());
        }
    }
}
