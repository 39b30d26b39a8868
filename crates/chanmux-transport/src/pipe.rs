use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, TransportError};
use crate::signal::DataSignal;

/// Default pipe capacity: 64 KiB.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Outcome of a non-blocking [`Pipe::try_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the caller's buffer.
    Data(usize),
    /// Nothing buffered yet; the writer is still open.
    Empty,
    /// The writer closed and every buffered byte has been consumed.
    Eof,
}

struct State {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    reader_closed: bool,
    writer_closed: bool,
}

impl State {
    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    fn push(&mut self, data: &[u8]) {
        let cap = self.buf.len();
        let tail = (self.head + self.len) % cap;
        let first = data.len().min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buf[..rest].copy_from_slice(&data[first..]);
        self.len += data.len();
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = out.len().min(self.len);
        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    signal: Option<Arc<DataSignal>>,
}

/// A fixed-capacity circular byte buffer joining one writer to one reader.
///
/// Both sides block: writers until the whole chunk fits, readers until at
/// least one byte is buffered or the writer has closed. Each side closes
/// independently and closing is idempotent.
///
/// `Pipe` is a cheap handle; clones refer to the same buffer. Applications
/// usually hold a [`PipeReader`] or [`PipeWriter`] endpoint, which closes its
/// side when dropped.
#[derive(Clone)]
pub struct Pipe {
    shared: Arc<Shared>,
}

impl Pipe {
    /// Create a pipe holding at most `capacity` bytes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Create a pipe that posts to `signal` whenever bytes are written or the
    /// writer closes.
    pub fn with_signal(capacity: usize, signal: Arc<DataSignal>) -> Self {
        Self::build(capacity, Some(signal))
    }

    fn build(capacity: usize, signal: Option<Arc<DataSignal>>) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buf: vec![0u8; capacity].into_boxed_slice(),
                    head: 0,
                    len: 0,
                    reader_closed: false,
                    writer_closed: false,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
                signal,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_producer_activity(&self) {
        if let Some(signal) = &self.shared.signal {
            signal.post();
        }
    }

    /// Total buffer size in bytes.
    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    /// Write all of `data`, blocking until space is available.
    ///
    /// Data is copied in chunks of at most [`Pipe::capacity`] bytes; a chunk
    /// no larger than the capacity is always written whole, never split.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let cap = self.capacity();
        for chunk in data.chunks(cap) {
            let mut state = self.lock();
            loop {
                if state.writer_closed {
                    return Err(TransportError::WriterClosed);
                }
                if state.reader_closed {
                    return Err(TransportError::ReaderClosed);
                }
                if state.free() >= chunk.len() {
                    break;
                }
                state = self
                    .shared
                    .writable
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.push(chunk);
            drop(state);
            self.shared.readable.notify_all();
            self.notify_producer_activity();
        }
        Ok(())
    }

    /// Read into `buf`, blocking until at least one byte is available.
    ///
    /// Returns `Ok(0)` once the writer has closed and the buffer is drained
    /// (or when `buf` is empty).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        loop {
            if state.reader_closed {
                return Err(TransportError::ReaderClosed);
            }
            if buf.is_empty() {
                return Ok(0);
            }
            if state.len > 0 {
                let n = state.pop(buf);
                drop(state);
                self.shared.writable.notify_all();
                return Ok(n);
            }
            if state.writer_closed {
                return Ok(0);
            }
            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drain buffered bytes into `buf` without blocking.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut state = self.lock();
        if state.reader_closed {
            return Err(TransportError::ReaderClosed);
        }
        if state.len > 0 && !buf.is_empty() {
            let n = state.pop(buf);
            drop(state);
            self.shared.writable.notify_all();
            return Ok(ReadOutcome::Data(n));
        }
        if state.len == 0 && state.writer_closed {
            return Ok(ReadOutcome::Eof);
        }
        Ok(ReadOutcome::Empty)
    }

    /// Number of bytes that can be read without blocking.
    pub fn available(&self) -> Result<usize> {
        let state = self.lock();
        if state.reader_closed {
            return Err(TransportError::ReaderClosed);
        }
        Ok(state.len)
    }

    /// Close the reading side. Buffered bytes are discarded and blocked
    /// writers fail. Idempotent.
    pub fn close_by_reader(&self) {
        let mut state = self.lock();
        if state.reader_closed {
            return;
        }
        state.reader_closed = true;
        state.len = 0;
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    /// Close the writing side. The reader drains what is buffered and then
    /// observes EOF. Idempotent.
    pub fn close_by_writer(&self) {
        let mut state = self.lock();
        if state.writer_closed {
            return;
        }
        state.writer_closed = true;
        drop(state);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
        self.notify_producer_activity();
    }

    /// Whether the reading side has been closed.
    pub fn is_reader_closed(&self) -> bool {
        self.lock().reader_closed
    }

    /// Whether the writing side has been closed.
    pub fn is_writer_closed(&self) -> bool {
        self.lock().writer_closed
    }

    /// Reading endpoint sharing this buffer.
    pub fn reader(&self) -> PipeReader {
        PipeReader { pipe: self.clone() }
    }

    /// Writing endpoint sharing this buffer.
    pub fn writer(&self) -> PipeWriter {
        PipeWriter { pipe: self.clone() }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Pipe")
            .field("capacity", &state.buf.len())
            .field("buffered", &state.len)
            .field("reader_closed", &state.reader_closed)
            .field("writer_closed", &state.writer_closed)
            .finish()
    }
}

/// Create a pipe and return its two endpoints.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let pipe = Pipe::new(capacity);
    (pipe.writer(), pipe.reader())
}

/// Consuming endpoint of a [`Pipe`]. Closes the reading side on drop.
#[derive(Debug)]
pub struct PipeReader {
    pipe: Pipe,
}

impl PipeReader {
    /// Number of bytes readable without blocking.
    pub fn available(&self) -> Result<usize> {
        self.pipe.available()
    }

    /// Close the reading side now rather than on drop.
    pub fn close(&self) {
        self.pipe.close_by_reader();
    }

    /// The underlying pipe handle.
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.pipe.read(buf).map_err(Into::into)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.pipe.close_by_reader();
    }
}

/// Producing endpoint of a [`Pipe`]. Closes the writing side on drop.
#[derive(Debug)]
pub struct PipeWriter {
    pipe: Pipe,
}

impl PipeWriter {
    /// Close the writing side now rather than on drop.
    pub fn close(&self) {
        self.pipe.close_by_writer();
    }

    /// The underlying pipe handle.
    pub fn pipe(&self) -> &Pipe {
        &self.pipe
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pipe.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.pipe.close_by_writer();
    }
}
