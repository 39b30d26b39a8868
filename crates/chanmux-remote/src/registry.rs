use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chanmux_frame::{ChannelId, Direction};
use chanmux_transport::{DataSignal, Pipe, PipeReader, PipeWriter};
use tracing::debug;

use crate::error::{RemoteError, Result};

#[derive(Default)]
struct Channels {
    inbound: HashMap<ChannelId, Pipe>,
    // Ordered so the multiplexer can resume its scan just past the last id
    // it serviced.
    outbound: BTreeMap<ChannelId, Pipe>,
    closed: bool,
}

/// The set of channels currently open on one connection.
///
/// Inbound channels hold the pipe the demultiplexer writes wire payloads
/// into; outbound channels hold the pipe the multiplexer drains onto the
/// wire. An id is open in at most one direction at a time.
pub struct ChannelRegistry {
    channels: Mutex<Channels>,
    signal: Arc<DataSignal>,
    pipe_capacity: usize,
}

impl ChannelRegistry {
    /// Create an empty registry whose pipes hold `pipe_capacity` bytes.
    pub fn new(pipe_capacity: usize) -> Self {
        Self {
            channels: Mutex::new(Channels::default()),
            signal: Arc::new(DataSignal::new()),
            pipe_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Semaphore posted by every outbound producer.
    pub fn signal(&self) -> &Arc<DataSignal> {
        &self.signal
    }

    /// Open a channel whose bytes arrive from the wire.
    ///
    /// Returns the endpoint the local consumer reads from.
    pub fn open_inbound(&self, id: ChannelId) -> Result<PipeReader> {
        let mut channels = self.lock();
        Self::check_free(&channels, id)?;
        let pipe = Pipe::new(self.pipe_capacity);
        channels.inbound.insert(id, pipe.clone());
        debug!(channel = id, direction = %Direction::Inbound, "channel opened");
        Ok(pipe.reader())
    }

    /// Open a channel whose bytes are sent over the wire.
    ///
    /// Returns the endpoint the local producer writes to. Dropping it sends
    /// end-of-stream to the peer.
    pub fn open_outbound(&self, id: ChannelId) -> Result<PipeWriter> {
        let mut channels = self.lock();
        Self::check_free(&channels, id)?;
        let pipe = Pipe::with_signal(self.pipe_capacity, Arc::clone(&self.signal));
        channels.outbound.insert(id, pipe.clone());
        debug!(channel = id, direction = %Direction::Outbound, "channel opened");
        Ok(pipe.writer())
    }

    fn check_free(channels: &Channels, id: ChannelId) -> Result<()> {
        if channels.closed {
            return Err(RemoteError::Terminated);
        }
        if channels.inbound.contains_key(&id) || channels.outbound.contains_key(&id) {
            return Err(RemoteError::ChannelInUse(id));
        }
        Ok(())
    }

    /// Pipe of an open inbound channel.
    pub fn inbound(&self, id: ChannelId) -> Option<Pipe> {
        self.lock().inbound.get(&id).cloned()
    }

    /// Forget an inbound channel, returning its pipe. Does not close it.
    pub fn take_inbound(&self, id: ChannelId) -> Option<Pipe> {
        self.lock().inbound.remove(&id)
    }

    /// Forget an outbound channel, returning its pipe. Does not close it.
    pub fn take_outbound(&self, id: ChannelId) -> Option<Pipe> {
        self.lock().outbound.remove(&id)
    }

    /// Locally remove a channel in whichever direction it is open.
    ///
    /// Inbound consumers observe EOF; outbound producers start failing. No
    /// end-of-stream frame is sent. Returns whether anything was removed.
    pub fn remove(&self, id: ChannelId) -> bool {
        let (inbound, outbound) = {
            let mut channels = self.lock();
            (channels.inbound.remove(&id), channels.outbound.remove(&id))
        };
        if let Some(pipe) = &inbound {
            pipe.close_by_writer();
        }
        if let Some(pipe) = &outbound {
            pipe.close_by_reader();
        }
        let removed = inbound.is_some() || outbound.is_some();
        if removed {
            debug!(channel = id, "channel removed locally");
        }
        removed
    }

    /// Snapshot of outbound channels in round-robin order, starting just past
    /// `last` (or from the lowest id when `last` is `None`).
    pub fn outbound_after(&self, last: Option<ChannelId>) -> Vec<(ChannelId, Pipe)> {
        let channels = self.lock();
        let (mut after, upto): (Vec<_>, Vec<_>) = channels
            .outbound
            .iter()
            .map(|(id, pipe)| (*id, pipe.clone()))
            .partition(|(id, _)| last.is_some_and(|last| *id > last));
        after.extend(upto);
        after
    }

    /// Whether `id` is open in either direction.
    pub fn contains(&self, id: ChannelId) -> bool {
        let channels = self.lock();
        channels.inbound.contains_key(&id) || channels.outbound.contains_key(&id)
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        let channels = self.lock();
        channels.inbound.len() + channels.outbound.len()
    }

    /// Whether no channel is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`ChannelRegistry::close_all`] has run.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close and forget every channel and refuse new ones.
    ///
    /// Releases every thread blocked on a channel pipe: consumers see EOF,
    /// producers get an error.
    pub fn close_all(&self) {
        let (inbound, outbound) = {
            let mut channels = self.lock();
            channels.closed = true;
            (
                std::mem::take(&mut channels.inbound),
                std::mem::take(&mut channels.outbound),
            )
        };
        debug!(
            inbound = inbound.len(),
            outbound = outbound.len(),
            "closing all channels"
        );
        for pipe in inbound.values() {
            pipe.close_by_writer();
        }
        for pipe in outbound.values() {
            pipe.close_by_reader();
        }
        self.signal.post();
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.lock();
        f.debug_struct("ChannelRegistry")
            .field("inbound", &channels.inbound.len())
            .field("outbound", &channels.outbound.len())
            .field("closed", &channels.closed)
            .finish()
    }
}
