use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Bytes requested from the stream per `read` call.
const FILL_SIZE: usize = 16 * 1024;

/// Pulls frames off a blocking byte stream.
///
/// Bytes beyond the current frame stay buffered for the next call, so one
/// `read` from the stream may yield several frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(FILL_SIZE),
            config,
        }
    }

    /// Block until the next whole frame is available.
    ///
    /// A stream that ends on a frame boundary yields
    /// [`FrameError::ConnectionClosed`]; one that ends inside a frame yields
    /// [`FrameError::Truncated`].
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }
            if self.fill()? == 0 {
                return Err(match self.buf.len() {
                    0 => FrameError::ConnectionClosed,
                    buffered => FrameError::Truncated { buffered },
                });
            }
        }
    }

    /// Bytes read from the stream but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Append one `read` worth of bytes to the buffer.
    fn fill(&mut self) -> Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + FILL_SIZE, 0);
        let result = loop {
            match self.inner.read(&mut self.buf[start..]) {
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        match result {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(err) => {
                self.buf.truncate(start);
                Err(FrameError::Io(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BufMut;

    use super::*;
    use crate::channel::{REPLY, REQUEST};
    use crate::codec::encode_frame;

    fn wire(frames: &[(i64, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in frames {
            encode_frame(*channel, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn one_read_can_yield_several_frames() {
        let bytes = wire(&[
            (REQUEST, &b"exec"[..]),
            (3, &b"out"[..]),
            (3, &b""[..]),
            (REPLY, &b"started"[..]),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let first = reader.read_frame().unwrap();
        assert_eq!((first.channel, first.payload.as_ref()), (REQUEST, &b"exec"[..]));
        assert!(reader.buffered() > 0);

        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), b"out");
        assert_eq!(reader.read_frame().unwrap(), Frame::eof(3));
        assert_eq!(reader.read_frame().unwrap().channel, REPLY);
        assert!(reader.read_frame().unwrap_err().is_clean_close());
    }

    #[test]
    fn frames_split_across_tiny_reads_reassemble() {
        let payload = vec![0x5A; 300];
        let mut reader = FrameReader::new(Trickle {
            data: wire(&[(7, payload.as_slice()), (8, &b"tail"[..])]),
            pos: 0,
            step: 3,
        });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 7);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), b"tail");
    }

    #[test]
    fn stream_ending_inside_a_frame_is_truncation() {
        let mut bytes = BytesMut::new();
        bytes.put_i64(2);
        bytes.put_u16(16);
        bytes.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(bytes.to_vec()));
        match reader.read_frame().unwrap_err() {
            FrameError::Truncated { buffered } => assert_eq!(buffered, 19),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn missing_padding_is_truncation() {
        let mut bytes = wire(&[(1, &b"abc"[..])]);
        bytes.pop();
        let mut reader = FrameReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::Truncated { .. })
        ));
    }

    #[test]
    fn size_over_configured_limit_is_rejected() {
        let mut bytes = BytesMut::new();
        bytes.put_i64(1);
        bytes.put_u16(1024);

        let config = FrameConfig {
            max_payload_size: 16,
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes.to_vec()), config);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::PayloadTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn interrupted_reads_are_retried_and_other_errors_surface() {
        struct Failing {
            kind: ErrorKind,
            inner: Cursor<Vec<u8>>,
            failed: bool,
        }

        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if !self.failed {
                    self.failed = true;
                    return Err(self.kind.into());
                }
                self.inner.read(buf)
            }
        }

        let mut reader = FrameReader::new(Failing {
            kind: ErrorKind::Interrupted,
            inner: Cursor::new(wire(&[(4, &b"ok"[..])])),
            failed: false,
        });
        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), b"ok");

        let mut reader = FrameReader::new(Failing {
            kind: ErrorKind::ConnectionReset,
            inner: Cursor::new(wire(&[(4, &b"ok"[..])])),
            failed: false,
        });
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::Io(err)) if err.kind() == ErrorKind::ConnectionReset
        ));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn frames_cross_a_socket_pair_in_order() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let consumer = std::thread::spawn(move || {
            (0..50i64)
                .map(|_| reader.read_frame().unwrap())
                .collect::<Vec<_>>()
        });
        for seq in 0..50i64 {
            writer
                .send(seq % 4 + 1, format!("chunk-{seq}").as_bytes())
                .unwrap();
        }

        let frames = consumer.join().unwrap();
        for (seq, frame) in frames.iter().enumerate() {
            assert_eq!(frame.channel, seq as i64 % 4 + 1);
            assert_eq!(frame.payload.as_ref(), format!("chunk-{seq}").as_bytes());
        }
    }
}
