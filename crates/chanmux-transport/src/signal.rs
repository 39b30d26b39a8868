use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Counting "data pending" semaphore.
///
/// Producers call [`DataSignal::post`] after they buffer bytes or close their
/// end of a pipe; the multiplexer waits on it between scans. Permits coalesce:
/// a single wait consumes every permit posted so far, since one scan services
/// all channels anyway.
#[derive(Debug, Default)]
pub struct DataSignal {
    permits: Mutex<u64>,
    cond: Condvar,
}

impl DataSignal {
    /// Create a signal with no pending permits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that data is pending and wake a waiter.
    pub fn post(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits = permits.saturating_add(1);
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for at least one permit.
    ///
    /// Returns the number of permits consumed (0 on timeout).
    pub fn wait_timeout(&self, timeout: Duration) -> u64 {
        let permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut permits, _timeout) = self
            .cond
            .wait_timeout_while(permits, timeout, |p| *p == 0)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *permits)
    }

    /// Number of permits currently pending.
    pub fn pending(&self) -> u64 {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
