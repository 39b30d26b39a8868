use std::io::Write;

use bytes::BytesMut;
use tracing::trace;

use crate::channel::ChannelId;
use crate::codec::{encode_frame, FrameConfig};
use crate::error::{FrameError, Result};

/// Encodes frames onto a blocking byte stream.
///
/// Frames can be queued and pushed out together with [`FrameWriter::flush`],
/// which lets the multiplexer emit one write per scan instead of one per
/// channel. [`FrameWriter::send`] queues and flushes in one step.
pub struct FrameWriter<T> {
    inner: T,
    pending: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            config,
        }
    }

    /// Encode a data frame into the pending buffer.
    ///
    /// An empty payload queues nothing; the zero-size frame means
    /// end-of-stream and is only produced by [`FrameWriter::queue_eof`].
    pub fn queue(&mut self, channel: ChannelId, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let max = self.config.max_payload_size;
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        encode_frame(channel, payload, &mut self.pending)
    }

    /// Encode the end-of-stream frame for `channel` into the pending buffer.
    pub fn queue_eof(&mut self, channel: ChannelId) -> Result<()> {
        trace!(channel, "end-of-stream queued");
        encode_frame(channel, &[], &mut self.pending)
    }

    /// Bytes queued but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Write every queued frame and flush the stream.
    ///
    /// On failure the queue is discarded: the stream is unusable anyway.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let result = self.inner.write_all(&self.pending);
            self.pending.clear();
            result?;
        }
        self.inner.flush()?;
        Ok(())
    }

    /// Queue one data frame and flush.
    pub fn send(&mut self, channel: ChannelId, payload: &[u8]) -> Result<()> {
        self.queue(channel, payload)?;
        self.flush()
    }

    /// Queue the end-of-stream frame for `channel` and flush.
    pub fn send_eof(&mut self, channel: ChannelId) -> Result<()> {
        self.queue_eof(channel)?;
        self.flush()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
