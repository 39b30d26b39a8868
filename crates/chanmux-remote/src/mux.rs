use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chanmux_frame::{ChannelId, FrameWriter};
use chanmux_transport::ReadOutcome;
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::registry::ChannelRegistry;

/// Drains outbound channels onto the physical stream.
///
/// Each scan visits every outbound channel once, starting just past the
/// channel serviced last, and sends at most one frame per channel. A busy
/// channel therefore cannot starve a quiet one.
pub struct Multiplexer<W: Write> {
    writer: FrameWriter<W>,
    registry: Arc<ChannelRegistry>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    last: Option<ChannelId>,
    buf: Vec<u8>,
}

impl<W: Write> Multiplexer<W> {
    pub fn new(
        writer: W,
        registry: Arc<ChannelRegistry>,
        config: &ConnectionConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            writer: FrameWriter::with_config(writer, config.frame_config()),
            registry,
            poll_interval: config.mux_poll_interval,
            stop,
            last: None,
            buf: vec![0u8; config.max_frame_payload],
        }
    }

    /// Scan until stopped or until the registry is closed.
    ///
    /// Any write error is fatal to the connection and is returned.
    pub fn run(mut self) -> Result<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                debug!("multiplexer stopping");
                return Ok(());
            }
            let progressed = self.service_cycle()?;
            if progressed {
                continue;
            }
            if self.registry.is_closed() {
                debug!("registry closed; multiplexer exiting");
                return Ok(());
            }
            self.registry.signal().wait_timeout(self.poll_interval);
        }
    }

    /// Run one round-robin scan and write its frames in one go. Returns
    /// whether any frame was written.
    pub fn service_cycle(&mut self) -> Result<bool> {
        let mut progressed = false;

        for (id, pipe) in self.registry.outbound_after(self.last) {
            match pipe.try_read(&mut self.buf) {
                Ok(ReadOutcome::Data(n)) => {
                    self.writer.queue(id, &self.buf[..n])?;
                    trace!(channel = id, size = n, "frame queued");
                    self.last = Some(id);
                    progressed = true;
                }
                Ok(ReadOutcome::Empty) => {}
                Ok(ReadOutcome::Eof) => {
                    self.writer.queue_eof(id)?;
                    self.registry.take_outbound(id);
                    debug!(channel = id, "producer closed; end of stream queued");
                    self.last = Some(id);
                    progressed = true;
                }
                Err(_) => {
                    // Removed locally between the snapshot and this read.
                    self.registry.take_outbound(id);
                }
            }
        }

        if progressed {
            self.writer.flush()?;
        }
        Ok(progressed)
    }

    /// Consume the multiplexer and return the inner frame writer.
    pub fn into_writer(self) -> FrameWriter<W> {
        self.writer
    }
}
