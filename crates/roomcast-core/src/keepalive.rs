//! Connection liveness.
//!
//! The outbound loop probes the peer every `ping_period`; the inbound loop
//! owns the read deadline. A fresh connection gets `2 × pong_wait` to send
//! anything; after that each frame (acknowledgments included) pushes the
//! deadline out to `pong_wait` from its arrival. A frame never pulls the
//! deadline in.

use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Default time allowed to read the next frame from the peer.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(10);

/// Default time allowed to write a frame to the peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Invalid liveness parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeepAliveError {
    #[error("pong_wait must be greater than zero")]
    ZeroPongWait,

    #[error("write_wait ({write_wait:?}) must be longer than the ping period ({ping_period:?})")]
    WriteWaitTooShort {
        write_wait: Duration,
        ping_period: Duration,
    },
}

/// Liveness parameters. `pong_wait` is the base unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveConfig {
    /// Read deadline after the initial window.
    pub pong_wait: Duration,
    /// Write deadline for every outbound frame, probes included.
    pub write_wait: Duration,
}

impl KeepAliveConfig {
    /// Create a config from explicit durations.
    #[must_use]
    pub fn new(pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            pong_wait,
            write_wait,
        }
    }

    /// Interval between liveness probes: 7/10 of `pong_wait`.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 7 / 10
    }

    /// Read deadline for a freshly accepted connection.
    #[must_use]
    pub fn initial_window(&self) -> Duration {
        self.pong_wait * 2
    }

    /// Validate the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`KeepAliveError`] if a probe could not complete before the
    /// write deadline.
    pub fn validate(&self) -> Result<(), KeepAliveError> {
        if self.pong_wait.is_zero() {
            return Err(KeepAliveError::ZeroPongWait);
        }
        let ping_period = self.ping_period();
        if self.write_wait <= ping_period {
            return Err(KeepAliveError::WriteWaitTooShort {
                write_wait: self.write_wait,
                ping_period,
            });
        }
        Ok(())
    }

    /// Ticker for the probe cycle. The first tick fires one period from now.
    #[must_use]
    pub fn probe_interval(&self) -> Interval {
        let period = self.ping_period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PONG_WAIT, DEFAULT_WRITE_WAIT)
    }
}

/// Read-deadline state for one connection.
#[derive(Debug)]
pub struct KeepAlive {
    config: KeepAliveConfig,
    deadline: Instant,
    window: Duration,
}

impl KeepAlive {
    /// Start tracking a connection accepted now.
    #[must_use]
    pub fn new(config: KeepAliveConfig) -> Self {
        let window = config.initial_window();
        Self {
            config,
            deadline: Instant::now() + window,
            window,
        }
    }

    /// Instant by which the next frame must arrive.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Length of the window currently being enforced.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record any inbound frame, acknowledgments included.
    pub fn on_frame(&mut self) {
        let refreshed = Instant::now() + self.config.pong_wait;
        if refreshed > self.deadline {
            self.deadline = refreshed;
            self.window = self.config.pong_wait;
        }
    }
}
