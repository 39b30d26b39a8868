//! Channel-addressed wire framing.
//!
//! Every chunk of a logical channel's byte stream travels as one frame:
//! - an 8-byte big-endian signed channel id
//! - a 2-byte big-endian payload size (zero marks end-of-stream)
//! - the payload, zero-padded to a multiple of 8 bytes
//!
//! No partial reads, no buffer management in user code.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, is_reserved, ChannelId, Direction, FIRST_DYNAMIC, REPLY, REQUEST};
pub use codec::{
    decode_frame, encode_frame, padded_len, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MAX_FRAME_PAYLOAD, PAYLOAD_ALIGN,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
