use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::channel::ChannelId;
use crate::error::{FrameError, Result};

/// Frame header: channel id (8) + size (2) = 10 bytes.
pub const HEADER_SIZE: usize = 10;

/// Payloads are zero-padded to a multiple of this many bytes on the wire.
pub const PAYLOAD_ALIGN: usize = 8;

/// Largest payload the 16-bit size field can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Default maximum payload size: 32 KiB (half the default pipe capacity).
pub const DEFAULT_MAX_PAYLOAD: usize = 32 * 1024;

/// A framed chunk of one channel's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this chunk belongs to.
    pub channel: ChannelId,
    /// The chunk itself, without wire padding. Empty means end-of-stream.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new data frame.
    pub fn new(channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Create the end-of-stream sentinel for `channel`.
    pub fn eof(channel: ChannelId) -> Self {
        Self {
            channel,
            payload: Bytes::new(),
        }
    }

    /// Whether this is the zero-size end-of-stream sentinel.
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }

    /// The total wire size of this frame (header + padded payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + padded_len(self.payload.len())
    }
}

/// Round `size` up to the next multiple of [`PAYLOAD_ALIGN`].
pub fn padded_len(size: usize) -> usize {
    size.div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN
}

/// Encode a frame into the wire format.
///
/// Wire format (all integers big-endian):
/// ```text
/// ┌──────────────────┬────────────┬──────────────────────────────┐
/// │ Channel id (8B)  │ Size (2B)  │ Payload, zero-padded to a    │
/// │ signed           │ unsigned   │ multiple of 8 bytes          │
/// └──────────────────┴────────────┴──────────────────────────────┘
/// ```
/// A size of zero carries no payload and marks end-of-stream.
pub fn encode_frame(channel: ChannelId, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }
    let padded = padded_len(payload.len());
    dst.reserve(HEADER_SIZE + padded);
    dst.put_i64(channel);
    dst.put_u16(payload.len() as u16);
    dst.put_slice(payload);
    dst.put_bytes(0, padded - payload.len());
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes (padding included) from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let mut header = &src[..HEADER_SIZE];
    let channel = header.get_i64();
    let size = usize::from(header.get_u16());

    if size > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }

    let padded = padded_len(size);
    if src.len() < HEADER_SIZE + padded {
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let mut payload = src.split_to(padded).freeze();
    payload.truncate(size);

    Ok(Some(Frame { channel, payload }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 32 KiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{REPLY, REQUEST};

    fn decode(buf: &mut BytesMut) -> Frame {
        decode_frame(buf, DEFAULT_MAX_PAYLOAD)
            .expect("frame should decode")
            .expect("frame should be complete")
    }

    #[test]
    fn header_is_signed_id_then_size_big_endian() {
        let mut buf = BytesMut::new();
        encode_frame(REPLY, b"abc", &mut buf).unwrap();

        assert_eq!(&buf[..8], &(-2i64).to_be_bytes());
        assert_eq!(&buf[8..10], &[0x00, 0x03]);
        assert_eq!(&buf[10..13], b"abc");
        assert_eq!(&buf[13..], &[0u8; 5]);
    }

    #[test]
    fn payload_is_padded_to_alignment() {
        for (len, wire) in [(1, 8), (7, 8), (8, 8), (9, 16), (300, 304)] {
            let mut buf = BytesMut::new();
            encode_frame(5, &vec![1u8; len], &mut buf).unwrap();
            assert_eq!(buf.len(), HEADER_SIZE + wire, "payload of {len} bytes");
            assert_eq!(Frame::new(5, vec![1u8; len]).wire_size(), buf.len());
        }
    }

    #[test]
    fn padding_content_is_ignored() {
        let mut buf = BytesMut::new();
        buf.put_i64(REQUEST);
        buf.put_u16(2);
        buf.put_slice(b"okJUNK!!");

        let frame = decode(&mut buf);
        assert_eq!(frame, Frame::new(REQUEST, "ok"));
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_size_is_end_of_stream_without_payload() {
        let mut buf = BytesMut::new();
        encode_frame(9, b"", &mut buf).unwrap();
        buf.put_i64(10);

        assert_eq!(decode(&mut buf), Frame::eof(9));
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn incomplete_input_is_left_untouched() {
        let mut whole = BytesMut::new();
        encode_frame(1, b"hello", &mut whole).unwrap();

        for cut in [0, 4, HEADER_SIZE, HEADER_SIZE + 5, whole.len() - 1] {
            let mut buf = BytesMut::from(&whole[..cut]);
            assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn limits_apply_on_both_sides() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(1, &vec![0u8; MAX_FRAME_PAYLOAD + 1], &mut buf),
            Err(FrameError::PayloadTooLarge { max: MAX_FRAME_PAYLOAD, .. })
        ));
        assert!(buf.is_empty());

        buf.put_i64(1);
        buf.put_u16(4096);
        assert!(matches!(
            decode_frame(&mut buf, 1024),
            Err(FrameError::PayloadTooLarge { size: 4096, max: 1024 })
        ));
    }

    #[test]
    fn largest_payload_survives() {
        let payload = vec![0xC3; MAX_FRAME_PAYLOAD];
        let mut buf = BytesMut::new();
        encode_frame(i64::MAX, &payload, &mut buf).unwrap();

        let frame = decode_frame(&mut buf, MAX_FRAME_PAYLOAD).unwrap().unwrap();
        assert_eq!(frame.channel, i64::MAX);
        assert_eq!(frame.payload.len(), MAX_FRAME_PAYLOAD);
        assert!(buf.is_empty());
    }
}
