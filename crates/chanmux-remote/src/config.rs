use std::time::Duration;

use chanmux_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD, MAX_FRAME_PAYLOAD};
use chanmux_transport::DEFAULT_PIPE_CAPACITY;

use crate::error::{RemoteError, Result};

/// Default interval between multiplexer scans when no producer signals.
pub const DEFAULT_MUX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-connection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Capacity of every channel pipe, in bytes.
    pub pipe_capacity: usize,
    /// Largest payload carried by one frame. Must be at most half of
    /// `pipe_capacity` so a whole frame always fits into an inbound pipe.
    pub max_frame_payload: usize,
    /// Upper bound on how long the multiplexer sleeps between scans.
    pub mux_poll_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
            mux_poll_interval: DEFAULT_MUX_POLL_INTERVAL,
        }
    }
}

impl ConnectionConfig {
    /// Override pipe capacity.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    /// Override maximum frame payload.
    pub fn with_max_frame_payload(mut self, size: usize) -> Self {
        self.max_frame_payload = size;
        self
    }

    /// Override the multiplexer poll interval.
    pub fn with_mux_poll_interval(mut self, interval: Duration) -> Self {
        self.mux_poll_interval = interval;
        self
    }

    /// Check the invariants the multiplexer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload == 0 {
            return Err(RemoteError::InvalidConfig(
                "max_frame_payload must be positive".to_string(),
            ));
        }
        if self.max_frame_payload > MAX_FRAME_PAYLOAD {
            return Err(RemoteError::InvalidConfig(format!(
                "max_frame_payload {} exceeds the 16-bit frame size limit {}",
                self.max_frame_payload, MAX_FRAME_PAYLOAD
            )));
        }
        if self.max_frame_payload.saturating_mul(2) > self.pipe_capacity {
            return Err(RemoteError::InvalidConfig(format!(
                "pipe_capacity {} must be at least twice max_frame_payload {}",
                self.pipe_capacity, self.max_frame_payload
            )));
        }
        if self.mux_poll_interval.is_zero() {
            return Err(RemoteError::InvalidConfig(
                "mux_poll_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Frame codec settings derived from this configuration.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_frame_payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = ConnectionConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.frame_config().max_payload_size, cfg.max_frame_payload);
    }

    #[test]
    fn frame_must_fit_twice_into_pipe() {
        let cfg = ConnectionConfig::default()
            .with_pipe_capacity(1024)
            .with_max_frame_payload(600);
        assert!(matches!(cfg.validate(), Err(RemoteError::InvalidConfig(_))));

        let cfg = cfg.with_max_frame_payload(512);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_frames_beyond_size_field() {
        let cfg = ConnectionConfig::default()
            .with_pipe_capacity(1 << 20)
            .with_max_frame_payload(MAX_FRAME_PAYLOAD + 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_values() {
        assert!(ConnectionConfig::default()
            .with_max_frame_payload(0)
            .validate()
            .is_err());
        assert!(ConnectionConfig::default()
            .with_mux_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
