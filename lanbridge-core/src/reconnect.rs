//! Reconnection controller: when and how often a client retries a dropped connection.
//!
//! The controller does no I/O. The client reports transport outcomes and the
//! controller answers with the next [`ReconnectStep`]. Every connection cycle
//! carries an epoch; an explicit `connect()` or `disconnect()` starts a new
//! epoch, so outcomes and timers from an older cycle are ignored.

use std::time::Duration;

use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Retry budget and linear backoff unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base_delay * attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Waiting for, or running, retry number `n`.
    Reconnecting(u32),
    /// Retries exhausted. Only an explicit connect leaves this state.
    Failed,
}

/// What the client should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    /// Sleep `delay`, then call [`ReconnectController::begin_retry`] with `epoch`.
    Retry {
        attempt: u32,
        delay: Duration,
        epoch: u64,
    },
    /// Retries exhausted; the controller is now `Failed`.
    GiveUp,
    /// Nothing to do.
    Stop,
}

#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
    epoch: u64,
    retry_in_flight: bool,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Idle,
            attempt: 0,
            epoch: 0,
            retry_in_flight: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Explicit connect. Resets the attempt counter, cancels any pending retry
    /// and returns the epoch of the new cycle.
    pub fn begin_connect(&mut self) -> u64 {
        self.epoch = self.epoch.wrapping_add(1);
        self.state = ConnectionState::Connecting;
        self.attempt = 0;
        self.retry_in_flight = false;
        self.epoch
    }

    /// Retry timer fired. Returns true if the caller should attempt the
    /// connection now. False for a stale epoch, for a state that is no longer
    /// `Reconnecting`, or when a retry is already running.
    pub fn begin_retry(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.retry_in_flight {
            return false;
        }
        match self.state {
            ConnectionState::Reconnecting(n) => {
                debug!(attempt = n, "retry started");
                self.retry_in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Transport established for `epoch`. Returns false if that cycle was
    /// superseded; the caller must then close the new connection.
    pub fn on_connected(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch {
            return false;
        }
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {
                if let ConnectionState::Reconnecting(n) = self.state {
                    info!(attempt = n, "reconnected");
                }
                self.state = ConnectionState::Connected;
                self.attempt = 0;
                self.retry_in_flight = false;
                true
            }
            _ => false,
        }
    }

    /// Transport failed before establishment. An explicit attempt falls back to
    /// `Idle` without retrying; a failed retry schedules the next one or gives up.
    pub fn on_connect_failed(&mut self, epoch: u64) -> ReconnectStep {
        if epoch != self.epoch {
            return ReconnectStep::Stop;
        }
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Idle;
                ReconnectStep::Stop
            }
            ConnectionState::Reconnecting(n) if self.retry_in_flight => {
                self.retry_in_flight = false;
                self.schedule(n.saturating_add(1))
            }
            _ => ReconnectStep::Stop,
        }
    }

    /// Connection dropped without the client asking for it.
    pub fn on_closed(&mut self, epoch: u64) -> ReconnectStep {
        if epoch != self.epoch || self.state != ConnectionState::Connected {
            return ReconnectStep::Stop;
        }
        if self.attempt < self.policy.max_attempts {
            self.schedule(self.attempt + 1)
        } else {
            self.give_up()
        }
    }

    /// Explicit disconnect. Cancels pending retries and never schedules new ones.
    pub fn on_disconnect_requested(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.state = ConnectionState::Idle;
        self.attempt = 0;
        self.retry_in_flight = false;
    }

    fn schedule(&mut self, attempt: u32) -> ReconnectStep {
        if attempt > self.policy.max_attempts {
            return self.give_up();
        }
        self.attempt = attempt;
        self.state = ConnectionState::Reconnecting(attempt);
        let delay = self.policy.delay_for(attempt);
        info!(
            attempt,
            max_attempts = self.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        ReconnectStep::Retry {
            attempt,
            delay,
            epoch: self.epoch,
        }
    }

    fn give_up(&mut self) -> ReconnectStep {
        warn!(max_attempts = self.policy.max_attempts, "max reconnection attempts reached");
        self.state = ConnectionState::Failed;
        self.retry_in_flight = false;
        ReconnectStep::GiveUp
    }
}

impl Default for ReconnectController {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}
