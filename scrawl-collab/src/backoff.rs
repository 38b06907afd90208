//! Exponential backoff for WebSocket reconnection.
//!
//! Both WebSocket transports embed one [`ReconnectBackoff`] each,
//! independently parameterized. The delay doubles after every failed
//! attempt that triggers a retry, caps at `initial × 8`, and resets to the
//! initial delay on every successful connection. At most one retry timer
//! is ever pending per transport — the timer lives inside the transport's
//! single supervisor loop.

use std::time::Duration;

/// Backoff parameters. The cap is fixed at eight times the initial delay.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffConfig {
    /// Config with the standard `initial × 8` cap.
    pub fn with_initial(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: initial_delay * 8,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::with_initial(Duration::from_secs(1))
    }
}

/// Where the reconnection loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Connecting,
    Connected,
    WaitingToRetry,
}

/// The backoff timer state machine.
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    current: Duration,
    state: RetryState,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            state: RetryState::Idle,
        }
    }

    /// The delay the next retry would use.
    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// A connection attempt is starting.
    pub fn connecting(&mut self) {
        self.state = RetryState::Connecting;
    }

    /// The attempt succeeded: reset the delay.
    pub fn connected(&mut self) {
        self.current = self.config.initial_delay;
        self.state = RetryState::Connected;
    }

    /// The connection closed or failed: returns the delay to wait before
    /// retrying, then doubles the stored delay (capped).
    pub fn next_retry(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.config.max_delay);
        self.state = RetryState::WaitingToRetry;
        delay
    }

    /// The retry timer fired; the loop is about to reconnect.
    pub fn retry_elapsed(&mut self) {
        self.state = RetryState::Connecting;
    }

    /// Teardown: cancel any notion of a pending retry.
    pub fn shutdown(&mut self) {
        self.current = self.config.initial_delay;
        self.state = RetryState::Idle;
    }
}
