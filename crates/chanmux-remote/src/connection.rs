use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chanmux_frame::ChannelId;
use chanmux_transport::{DuplexStream, Interrupt, PipeReader, PipeWriter};
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::demux::Demultiplexer;
use crate::error::Result;
use crate::mux::Multiplexer;
use crate::registry::ChannelRegistry;

/// Spawn a named OS thread.
pub(crate) fn spawn_named<F, T>(name: impl Into<String>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(thread::Builder::new().name(name.into()).spawn(f)?)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    registry: Arc<ChannelRegistry>,
    config: ConnectionConfig,
    kind: &'static str,
    stop: Arc<AtomicBool>,
    terminated: Mutex<bool>,
    terminated_cond: Condvar,
    interrupt: Mutex<Option<Box<dyn Interrupt>>>,
    interruptible: bool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    /// Tear the connection down. Safe to call from any thread, any number of
    /// times; only the first call does work.
    fn terminate(&self, reason: &str) {
        {
            let mut terminated = lock(&self.terminated);
            if *terminated {
                return;
            }
            *terminated = true;
        }
        info!(stream = self.kind, reason, "connection terminated");

        self.stop.store(true, Ordering::SeqCst);
        self.registry.close_all();

        if let Some(hook) = lock(&self.interrupt).take() {
            if let Err(err) = hook.interrupt() {
                debug!(error = %err, "interrupting physical stream failed");
            }
        }

        self.terminated_cond.notify_all();
    }
}

/// One multiplexed connection over a physical duplex stream.
///
/// Owns the demultiplexer and multiplexer threads and the channel registry
/// they share. Clones are handles to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Split `stream` and start the demultiplexer and multiplexer threads.
    pub fn start(stream: DuplexStream, config: ConnectionConfig) -> Result<Self> {
        Self::start_with(stream, config, |_| Ok(())).map(|(connection, ())| connection)
    }

    /// Like [`Connection::start`], but runs `setup` against the empty
    /// registry before any frame is read, so channels the peer may address
    /// immediately (the control channels) already exist.
    pub fn start_with<T>(
        stream: DuplexStream,
        config: ConnectionConfig,
        setup: impl FnOnce(&ChannelRegistry) -> Result<T>,
    ) -> Result<(Self, T)> {
        config.validate()?;

        let kind = stream.kind();
        let interruptible = stream.can_interrupt();
        let (reader, writer, interrupt) = stream.into_split();

        let registry = Arc::new(ChannelRegistry::new(config.pipe_capacity));
        let prepared = setup(&registry)?;
        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::new(Inner {
            registry: Arc::clone(&registry),
            config: config.clone(),
            kind,
            stop: Arc::clone(&stop),
            terminated: Mutex::new(false),
            terminated_cond: Condvar::new(),
            interrupt: Mutex::new(interrupt),
            interruptible,
            threads: Mutex::new(Vec::with_capacity(2)),
        });

        let demux = Demultiplexer::new(reader, Arc::clone(&registry), config.frame_config());
        let demux_handle = spawn_named("chanmux-demux", {
            let inner = Arc::clone(&inner);
            move || match demux.run() {
                Ok(()) => inner.terminate("peer closed the stream"),
                Err(err) => {
                    error!(error = %err, "demultiplexer failed");
                    inner.terminate("inbound transport failure");
                }
            }
        })?;

        let mux = Multiplexer::new(writer, registry, &config, stop);
        let mux_handle = match spawn_named("chanmux-mux", {
            let inner = Arc::clone(&inner);
            move || match mux.run() {
                Ok(()) => inner.terminate("multiplexer stopped"),
                Err(err) => {
                    error!(error = %err, "multiplexer failed");
                    inner.terminate("outbound transport failure");
                }
            }
        }) {
            Ok(handle) => handle,
            Err(err) => {
                inner.terminate("failed to start multiplexer");
                return Err(err);
            }
        };

        lock(&inner.threads).extend([mux_handle, demux_handle]);
        info!(
            stream = kind,
            pipe_capacity = config.pipe_capacity,
            max_frame_payload = config.max_frame_payload,
            "connection started"
        );

        Ok((Self { inner }, prepared))
    }

    /// The channel table shared by both pump threads.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.inner.registry
    }

    /// Settings this connection was started with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Open a channel whose bytes arrive from the peer.
    pub fn open_inbound(&self, id: ChannelId) -> Result<PipeReader> {
        self.inner.registry.open_inbound(id)
    }

    /// Open a channel whose bytes are sent to the peer.
    pub fn open_outbound(&self, id: ChannelId) -> Result<PipeWriter> {
        self.inner.registry.open_outbound(id)
    }

    /// Drop a channel locally without sending end-of-stream.
    pub fn remove_channel(&self, id: ChannelId) -> bool {
        self.inner.registry.remove(id)
    }

    pub fn is_terminated(&self) -> bool {
        *lock(&self.inner.terminated)
    }

    /// Block until the connection has terminated.
    pub fn wait_terminated(&self) {
        let mut terminated = lock(&self.inner.terminated);
        while !*terminated {
            terminated = self
                .inner
                .terminated_cond
                .wait(terminated)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the connection has terminated or `timeout` elapses.
    /// Returns whether it terminated.
    pub fn wait_terminated_timeout(&self, timeout: Duration) -> bool {
        let terminated = lock(&self.inner.terminated);
        let (terminated, _) = self
            .inner
            .terminated_cond
            .wait_timeout_while(terminated, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *terminated
    }

    /// Stop both pump threads, close every channel and join what can be
    /// joined. Idempotent.
    ///
    /// A demultiplexer blocked on a stream without an interrupt hook (plain
    /// stdio) is left detached; it exits when the peer closes.
    pub fn shutdown(&self) {
        self.inner.terminate("local shutdown");
        self.inner.registry.signal().post();

        let handles: Vec<_> = std::mem::take(&mut *lock(&self.inner.threads));
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let is_demux = handle.thread().name() == Some("chanmux-demux");
            if is_demux && !self.inner.interruptible {
                debug!("leaving demultiplexer detached; stream cannot be interrupted");
                continue;
            }
            if handle.join().is_err() {
                warn!("connection thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.inner.kind)
            .field("registry", &self.inner.registry)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
