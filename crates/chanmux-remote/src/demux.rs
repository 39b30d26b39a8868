use std::io::Read;
use std::sync::Arc;

use chanmux_frame::{channel_name, Frame, FrameConfig, FrameError, FrameReader};
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::registry::ChannelRegistry;

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Payload bytes were written into the channel's pipe.
    Delivered(usize),
    /// End-of-stream: the channel was closed and removed.
    EndOfStream,
    /// No channel with this id is open; the frame was dropped.
    UnknownChannel,
    /// The local consumer already went away; the payload was dropped.
    Discarded,
}

/// Reads frames off the physical stream and routes them to channels.
///
/// Writing into an inbound pipe blocks while that pipe is full, so one slow
/// consumer stalls delivery to every channel of the connection.
pub struct Demultiplexer<R> {
    reader: FrameReader<R>,
    registry: Arc<ChannelRegistry>,
}

impl<R: Read> Demultiplexer<R> {
    pub fn new(reader: R, registry: Arc<ChannelRegistry>, config: FrameConfig) -> Self {
        Self {
            reader: FrameReader::with_config(reader, config),
            registry,
        }
    }

    /// Route frames until the stream ends.
    ///
    /// Returns `Ok(())` when the peer closes the stream and an error on any
    /// other transport failure. Either way the connection is finished.
    pub fn run(mut self) -> Result<()> {
        loop {
            match self.reader.read_frame() {
                Ok(frame) => {
                    self.dispatch(frame);
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!("physical stream closed by peer");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Deliver one frame to its channel.
    pub fn dispatch(&self, frame: Frame) -> Dispatch {
        let id = frame.channel;

        if frame.is_eof() {
            return match self.registry.take_inbound(id) {
                Some(pipe) => {
                    pipe.close_by_writer();
                    debug!(channel = id, "end of stream; channel removed");
                    Dispatch::EndOfStream
                }
                None => {
                    warn!(
                        channel = id,
                        channel_name = channel_name(id),
                        "end-of-stream for unknown channel dropped"
                    );
                    Dispatch::UnknownChannel
                }
            };
        }

        let Some(pipe) = self.registry.inbound(id) else {
            warn!(
                channel = id,
                channel_name = channel_name(id),
                size = frame.payload.len(),
                "frame for unknown channel dropped"
            );
            return Dispatch::UnknownChannel;
        };

        match pipe.write(&frame.payload) {
            Ok(()) => {
                trace!(channel = id, size = frame.payload.len(), "frame delivered");
                Dispatch::Delivered(frame.payload.len())
            }
            Err(err) => {
                debug!(channel = id, error = %err, "consumer gone; frame discarded");
                Dispatch::Discarded
            }
        }
    }
}
